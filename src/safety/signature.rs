// src/safety/signature.rs
// Crash-signature algorithm (spec.md §6), bit-exact so dedup survives
// restarts: strip each line; among non-empty lines, pick the last containing
// `Error` or `Exception`, truncated to 200 UTF-8 code units; else the last
// non-empty line, same truncation; else the constant `unknown_crash`.

const MAX_LEN: usize = 200;
const FALLBACK: &str = "unknown_crash";

pub type CrashSignature = String;

fn truncate(s: &str) -> String {
    s.chars().take(MAX_LEN).collect()
}

pub fn signature(stderr: &str) -> CrashSignature {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    if let Some(line) = lines.iter().rev().find(|l| l.contains("Error") || l.contains("Exception")) {
        return truncate(line);
    }

    if let Some(line) = lines.last() {
        return truncate(line);
    }

    FALLBACK.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_last_error_containing_line() {
        let trace = "  File \"x.py\", line 1\nValueError: bad\nmore noise\nNameError: oops\n";
        assert_eq!(signature(trace), "NameError: oops");
    }

    #[test]
    fn falls_back_to_last_nonempty_line() {
        let trace = "just some output\nwith no error markers\n";
        assert_eq!(signature(trace), "with no error markers");
    }

    #[test]
    fn falls_back_to_constant_when_empty() {
        assert_eq!(signature("\n\n   \n"), "unknown_crash");
        assert_eq!(signature(""), "unknown_crash");
    }

    #[test]
    fn truncates_to_200_utf8_code_units() {
        let long_line = format!("Error: {}", "x".repeat(500));
        let sig = signature(&long_line);
        assert_eq!(sig.chars().count(), MAX_LEN);
    }

    #[test]
    fn stable_across_differing_prefixes() {
        let a = "boot sequence 1\nNameError: name 'MAX_TOOL_ITERATIONS' is not defined\n";
        let b = "different boot log entirely\nNameError: name 'MAX_TOOL_ITERATIONS' is not defined\n";
        assert_eq!(signature(a), signature(b));
    }
}
