//! Content type detection from leading bytes
//!
//! Declared names and client-supplied types are never trusted for the
//! blocklist decision; only the assembled bytes are.

/// Detect a MIME type from the first bytes of a file.
///
/// Returns `None` when no signature matches with confidence.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 2 {
        return None;
    }

    // Executables first: these drive the blocklist
    if bytes.starts_with(b"MZ") {
        return Some("application/x-msdownload");
    }
    if bytes.starts_with(b"\x7fELF") {
        return Some("application/x-executable");
    }
    if is_mach_o(bytes) {
        return Some("application/x-mach-binary");
    }
    if bytes.starts_with(b"#!") {
        return shebang(bytes);
    }

    // Documents and archives
    if bytes.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if bytes.starts_with(b"PK\x03\x04") {
        // EPUB carries its mimetype as the first stored entry at offset 30
        if let Ok(s) = std::str::from_utf8(&bytes[..bytes.len().min(58)]) {
            if s.contains("application/epub+zip") {
                return Some("application/epub+zip");
            }
        }
        return Some("application/zip");
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Some("application/x-cfb");
    }
    if bytes.starts_with(&[0x1F, 0x8B]) {
        return Some("application/gzip");
    }
    if bytes.starts_with(b"BZh") {
        return Some("application/x-bzip2");
    }
    if bytes.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
        return Some("application/x-xz");
    }
    if bytes.starts_with(&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some("application/x-7z-compressed");
    }
    if bytes.starts_with(b"Rar!\x1a\x07") {
        return Some("application/x-rar-compressed");
    }
    if bytes.starts_with(b"\0asm") {
        return Some("application/wasm");
    }
    if bytes.starts_with(b"SQLite format 3\0") {
        return Some("application/x-sqlite3");
    }

    // Images
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if riff(bytes, b"WEBP") {
        return Some("image/webp");
    }

    // Audio/video
    if riff(bytes, b"WAVE") {
        return Some("audio/wav");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    if bytes.starts_with(b"OggS") {
        return Some("audio/ogg");
    }
    if bytes.starts_with(b"fLaC") {
        return Some("audio/flac");
    }
    if bytes.starts_with(b"ID3") {
        return Some("audio/mpeg");
    }

    None
}

/// Whether a detected type is on the blocklist
pub fn is_blocked(mime: &str, blocked: &[String]) -> bool {
    blocked.iter().any(|b| b.eq_ignore_ascii_case(mime))
}

fn is_mach_o(bytes: &[u8]) -> bool {
    const MAGICS: [[u8; 4]; 4] = [
        [0xFE, 0xED, 0xFA, 0xCE],
        [0xFE, 0xED, 0xFA, 0xCF],
        [0xCE, 0xFA, 0xED, 0xFE],
        [0xCF, 0xFA, 0xED, 0xFE],
    ];
    bytes.len() >= 4 && MAGICS.iter().any(|m| bytes.starts_with(m))
}

fn riff(bytes: &[u8], form: &[u8; 4]) -> bool {
    bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == form
}

fn shebang(bytes: &[u8]) -> Option<&'static str> {
    let line_end = bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len());
    let line = std::str::from_utf8(&bytes[2..line_end]).ok()?;
    let interpreter = line.split_whitespace().collect::<Vec<_>>();

    // `#!/usr/bin/env bash` names the shell as the first argument
    let program = match interpreter.as_slice() {
        [env, arg, ..] if env.ends_with("/env") => *arg,
        [path, ..] => path.rsplit('/').next().unwrap_or_default(),
        [] => return None,
    };

    match program {
        "sh" | "bash" | "dash" | "zsh" | "ksh" => Some("application/x-sh"),
        _ => None,
    }
}
