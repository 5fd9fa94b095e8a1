//! Input validation for values arriving from the transport layer
//!
//! Everything here runs before storage is touched.

use uuid::{Uuid, Version};

use super::types::{UploadError, MAX_NAME_LEN};

fn uuid_v4(field: &str, value: &str) -> Result<(), UploadError> {
    match Uuid::parse_str(value) {
        Ok(id) if id.get_version() == Some(Version::Random) => Ok(()),
        _ => Err(UploadError::InvalidInput(format!(
            "{field} must be a valid UUID v4"
        ))),
    }
}

/// Session ids are client-generated UUID v4 strings
pub fn session_id(value: &str) -> Result<(), UploadError> {
    uuid_v4("uuid", value)
}

/// Collection ids are client-generated UUID v4 strings
pub fn collection_id(value: &str) -> Result<(), UploadError> {
    uuid_v4("collectionID", value)
}

/// Parse a chunk index as sent on the wire
pub fn chunk_index(value: &str) -> Result<u32, UploadError> {
    value.trim().parse::<u32>().map_err(|_| {
        UploadError::InvalidInput("chunkIndex must be a non-negative integer".to_string())
    })
}

/// Parse a declared chunk count as sent on the wire
pub fn chunk_count(value: &str) -> Result<u32, UploadError> {
    match value.trim().parse::<u32>() {
        Ok(count) if count >= 1 => Ok(count),
        _ => Err(UploadError::InvalidInput(
            "chunkCount must be a positive integer".to_string(),
        )),
    }
}

/// Trimmed, 1..=255 characters
pub fn original_name(value: &str) -> Result<String, UploadError> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(UploadError::InvalidInput(format!(
            "File name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// SHA-256 as 64 hex characters; returned lowercase
pub fn checksum(value: &str) -> Result<String, UploadError> {
    let normalized = value.trim().to_ascii_lowercase();
    if normalized.len() != 64 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(UploadError::InvalidInput(
            "checksum must be a valid SHA-256 hex string".to_string(),
        ));
    }
    Ok(normalized)
}

/// Public identifiers only use the allocator alphabet or hex
pub fn public_id(value: &str) -> Result<(), UploadError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'));
    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidInput("Invalid file name format".to_string()))
    }
}

/// Make an uploaded name safe for a download header
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    sanitized = sanitized.replace("..", "_");
    let sanitized = sanitized.trim_start_matches('.');

    let mut result = sanitized.to_string();
    if result.chars().count() > MAX_NAME_LEN {
        let ext = match result.rfind('.') {
            Some(pos) if pos > 0 => result[pos..].to_string(),
            _ => String::new(),
        };
        let keep = MAX_NAME_LEN.saturating_sub(ext.chars().count());
        result = result.chars().take(keep).collect::<String>() + &ext;
    }

    if result.is_empty() {
        "download".to_string()
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_requires_v4() {
        assert!(session_id(&Uuid::new_v4().to_string()).is_ok());
        assert!(session_id("not-a-uuid").is_err());
        // nil uuid has no version 4 marker
        assert!(session_id("00000000-0000-0000-0000-000000000000").is_err());
    }

    #[test]
    fn test_chunk_index_parsing() {
        assert_eq!(chunk_index("0").unwrap(), 0);
        assert_eq!(chunk_index(" 17 ").unwrap(), 17);
        assert!(chunk_index("-1").is_err());
        assert!(chunk_index("1.5").is_err());
        assert!(chunk_count("0").is_err());
        assert_eq!(chunk_count("3").unwrap(), 3);
    }

    #[test]
    fn test_checksum_normalized() {
        let upper = "A".repeat(64);
        assert_eq!(checksum(&upper).unwrap(), "a".repeat(64));
        assert!(checksum("abc").is_err());
        assert!(checksum(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_original_name_bounds() {
        assert_eq!(original_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(original_name("   ").is_err());
        assert!(original_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_public_id_rejects_paths() {
        assert!(public_id("aB3-_.~x").is_ok());
        assert!(public_id("..").is_err());
        assert!(public_id("a/b").is_err());
        assert!(public_id("").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("a\u{0}b\nc.txt"), "abc.txt");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("..."), "_.");

        let long = format!("{}.pdf", "n".repeat(300));
        let cut = sanitize_filename(&long);
        assert_eq!(cut.chars().count(), MAX_NAME_LEN);
        assert!(cut.ends_with(".pdf"));
    }
}
