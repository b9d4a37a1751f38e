//! Container and blob name validation.
//!
//! Names are checked before any store call so a malformed path never
//! costs a round trip.  Container rules follow the blob service: 3-63
//! characters of lowercase letters, digits and single hyphens, starting
//! and ending with a letter or digit.

/// Maximum blob name length in characters.
pub const MAX_BLOB_NAME_LEN: usize = 1024;

/// Maximum length of one `/`-separated blob path segment.
pub const MAX_SEGMENT_LEN: usize = 254;

/// Validate a container name, returning the reason on failure.
pub fn validate_container_name(name: &str) -> Result<(), &'static str> {
    if !(3..=63).contains(&name.len()) {
        return Err("container names must be 3 to 63 characters long");
    }

    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err("container names may only contain lowercase letters, digits and hyphens");
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err("container names must start and end with a letter or digit");
    }

    if name.contains("--") {
        return Err("container names may not contain consecutive hyphens");
    }

    Ok(())
}

/// Validate a blob name, returning the reason on failure.
///
/// Empty path segments and trailing `/` or `.` are rejected because they
/// cannot round-trip through a file path.
pub fn validate_blob_name(name: &str) -> Result<(), &'static str> {
    let chars = name.chars().count();
    if chars == 0 {
        return Err("blob names may not be empty");
    }
    if chars > MAX_BLOB_NAME_LEN {
        return Err("blob names may not exceed 1024 characters");
    }

    if name.chars().any(char::is_control) {
        return Err("blob names may not contain control characters");
    }

    if name.ends_with('/') || name.ends_with('.') {
        return Err("blob names may not end with '/' or '.'");
    }

    for segment in name.split('/') {
        if segment.is_empty() {
            return Err("blob names may not contain empty path segments");
        }
        if segment.chars().count() > MAX_SEGMENT_LEN {
            return Err("blob path segments may not exceed 254 characters");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_container_names() {
        for name in ["abc", "docs", "my-container-01", "a1b2c3", &"a".repeat(63)] {
            assert!(validate_container_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_container_names() {
        let too_long = "a".repeat(64);
        for name in [
            "ab",
            too_long.as_str(),
            "Docs",
            "my_container",
            "my.container",
            "-docs",
            "docs-",
            "do--cs",
            "desktop.ini",
        ] {
            assert!(validate_container_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn test_valid_blob_names() {
        for name in ["report.txt", "a", "dir/sub/file.bin", "with space", "ünïcode"] {
            assert!(validate_blob_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_blob_names() {
        let long_segment = "x".repeat(255);
        let too_long = "a/".repeat(512) + "a";
        for name in [
            "",
            "dir/",
            "file.",
            "a//b",
            "/leading",
            "tab\there",
            long_segment.as_str(),
            too_long.as_str(),
        ] {
            assert!(validate_blob_name(name).is_err(), "{name:?}");
        }
    }
}
