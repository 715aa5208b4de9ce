use regex::Regex;
use std::sync::OnceLock;

/// Which tagged block of a response stream to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

fn header_regex() -> Option<&'static Regex> {
    static HEADER: OnceLock<Option<Regex>> = OnceLock::new();
    HEADER
        .get_or_init(|| Regex::new(r"(\d*)/(.*)/(stdout|stderr):").ok())
        .as_ref()
}

/// Lines of the block tagged `<id>/<uuid>/<kind>:`, up to the next header.
///
/// Returns an empty string when no such block exists or it has no lines.
#[must_use]
pub fn extract_tagged(response: &str, uuid: &str, kind: StreamKind) -> String {
    let mut collecting = false;
    let mut output: Vec<&str> = Vec::new();

    let Some(header) = header_regex() else {
        return String::new();
    };

    for line in response.lines() {
        if let Some(caps) = header.captures(line) {
            if collecting {
                break;
            }

            collecting = &caps[2] == uuid && &caps[3] == kind.as_str();
            continue;
        }

        if collecting {
            output.push(line);
        }
    }

    output.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "\
12/aaaa-1111/stdout:
inet 10.0.0.1/24
line two
12/aaaa-1111/stderr:
warning: something
12/bbbb-2222/stdout:
inet 10.0.0.2/24
";

    #[test]
    fn test_extracts_matching_block() {
        assert_eq!(
            extract_tagged(STREAM, "aaaa-1111", StreamKind::Stdout),
            "inet 10.0.0.1/24\nline two"
        );
        assert_eq!(
            extract_tagged(STREAM, "aaaa-1111", StreamKind::Stderr),
            "warning: something"
        );
        assert_eq!(
            extract_tagged(STREAM, "bbbb-2222", StreamKind::Stdout),
            "inet 10.0.0.2/24"
        );
    }

    #[test]
    fn test_missing_block_is_empty() {
        assert_eq!(extract_tagged(STREAM, "bbbb-2222", StreamKind::Stderr), "");
        assert_eq!(extract_tagged("", "aaaa-1111", StreamKind::Stdout), "");
    }

    #[test]
    fn test_empty_block_stops_at_next_header() {
        let stream = "3/u1/stdout:\n3/u2/stdout:\nnot mine\n";
        assert_eq!(extract_tagged(stream, "u1", StreamKind::Stdout), "");
    }
}
