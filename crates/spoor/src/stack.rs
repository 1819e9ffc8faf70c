//! Backtrace capture behind a pluggable generator.
//!
//! The default generator walks the stack with the `backtrace` crate and
//! symbolizes in-process. Symbolication quality is platform-dependent;
//! anything unresolved becomes a `"??"` placeholder rather than an
//! error. Applications with their own symbolication (or none) install a
//! different generator.

use spoor_types::{Backtrace, StackFrame};

pub trait BacktraceGenerator: Send + Sync {
    fn capture(&self) -> Backtrace;
}

pub struct SystemBacktraceGenerator {
    max_frames: usize,
}

impl Default for SystemBacktraceGenerator {
    fn default() -> Self {
        Self { max_frames: 256 }
    }
}

impl SystemBacktraceGenerator {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }
}

impl BacktraceGenerator for SystemBacktraceGenerator {
    fn capture(&self) -> Backtrace {
        let mut frames = Vec::new();
        let mut skipping_capture_machinery = true;

        backtrace::trace(|frame| {
            if frames.len() >= self.max_frames {
                return false;
            }

            let ip = frame.ip() as usize as u64;
            let mut resolved = StackFrame {
                module: String::from("??"),
                function: String::from("??"),
                function_offset: 0,
                source_file: String::new(),
                line_number: 0,
            };

            backtrace::resolve_frame(frame, |symbol| {
                if let Some(name) = symbol.name() {
                    let demangled = name.to_string();
                    resolved.module = crate_of(&demangled);
                    resolved.function = demangled;
                }
                if let Some(addr) = symbol.addr() {
                    let addr = addr as usize as u64;
                    if ip >= addr {
                        resolved.function_offset = ip - addr;
                    }
                }
                if let Some(file) = symbol.filename() {
                    resolved.source_file = file.display().to_string();
                }
                if let Some(line) = symbol.lineno() {
                    resolved.line_number = line;
                }
            });

            // Drop the capture machinery itself (this closure, the
            // backtrace crate internals) from the top of the stack.
            if skipping_capture_machinery {
                if resolved.function.starts_with("backtrace::")
                    || resolved.module == "spoor"
                {
                    return true;
                }
                skipping_capture_machinery = false;
            }

            frames.push(resolved);
            true
        });

        Backtrace(frames)
    }
}

/// Leading path segment of a demangled Rust symbol, used as the module
/// column; foreign or unsegmented symbols fall back to `"??"`.
fn crate_of(symbol: &str) -> String {
    match symbol.split("::").next() {
        Some(first) if !first.is_empty() && first != symbol => first.to_string(),
        _ => String::from("??"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_yields_frames_innermost_first() {
        let generator = SystemBacktraceGenerator::default();
        let backtrace = generator.capture();
        assert!(!backtrace.is_empty(), "a live thread has a stack");
        assert!(backtrace.depth() <= 256);
    }

    #[test]
    fn max_frames_bounds_the_capture() {
        let generator = SystemBacktraceGenerator::new(2);
        let backtrace = generator.capture();
        assert!(backtrace.depth() <= 2);
    }

    #[test]
    fn crate_of_extracts_the_leading_segment() {
        assert_eq!(crate_of("spoor::dispatcher::visit"), "spoor");
        assert_eq!(crate_of("plain_c_symbol"), "??");
        assert_eq!(crate_of(""), "??");
    }
}
