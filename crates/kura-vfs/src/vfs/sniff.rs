//! Content-type detection for staged uploads.
//!
//! Looks at no more than the first 512 bytes, matching well-known magic
//! numbers and falling back to `text/plain` or `application/octet-stream`.

/// Number of leading bytes considered.
pub const SNIFF_LEN: usize = 512;

const OCTET_STREAM: &str = "application/octet-stream";

/// Exact prefix signatures.
const MAGIC: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"\x00\x00\x02\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"ID3", "audio/mpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"MThd\x00\x00\x00\x06", "audio/midi"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    (b"\x00\x61\x73\x6D", "application/wasm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"OTTO", "font/otf"),
];

/// Case-insensitive HTML tag openers; each must be followed by a space
/// or `>`.
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Guess the MIME type of `data`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    if let Some(ty) = sniff_markup(data) {
        return ty;
    }
    for (magic, ty) in MAGIC {
        if data.starts_with(magic) {
            return ty;
        }
    }
    if let Some(ty) = sniff_riff(data) {
        return ty;
    }
    if is_mp4(data) {
        return "video/mp4";
    }
    if data.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        "text/plain; charset=utf-8"
    }
}

fn sniff_markup(data: &[u8]) -> Option<&'static str> {
    let start = data.iter().position(|b| !b.is_ascii_whitespace())?;
    let text = &data[start..];

    for tag in HTML_TAGS {
        if text.len() <= tag.len() || !text[..tag.len()].eq_ignore_ascii_case(tag) {
            continue;
        }
        if matches!(text[tag.len()], b' ' | b'>') {
            return Some("text/html; charset=utf-8");
        }
    }
    if text.starts_with(b"<?xml") {
        return Some("text/xml; charset=utf-8");
    }
    None
}

fn sniff_riff(data: &[u8]) -> Option<&'static str> {
    if data.len() < 12 || &data[..4] != b"RIFF" {
        return None;
    }
    match &data[8..12] {
        b"WAVE" => Some("audio/wave"),
        b"AVI " => Some("video/avi"),
        b"WEBP" => Some("image/webp"),
        _ => None,
    }
}

fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size < 12 || box_size > data.len() || box_size % 4 != 0 {
        return false;
    }
    if &data[4..8] != b"ftyp" {
        return false;
    }
    // Major brand at 8..12, minor version at 12..16, then compatible brands.
    std::iter::once(8)
        .chain((16..box_size).step_by(4))
        .any(|i| data.get(i..i + 3) == Some(&b"mp4"[..]))
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_text() {
        assert_eq!(detect_content_type(b""), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_magic_numbers() {
        assert_eq!(detect_content_type(b"%PDF-1.7\n..."), "application/pdf");
        assert_eq!(
            detect_content_type(b"\x89PNG\x0D\x0A\x1A\x0A\x00\x00"),
            "image/png"
        );
        assert_eq!(detect_content_type(b"PK\x03\x04rest"), "application/zip");
        assert_eq!(detect_content_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
    }

    #[test]
    fn test_html_after_whitespace() {
        assert_eq!(
            detect_content_type(b"  \n<html><body>hi</body></html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            detect_content_type(b"<!doctype html>"),
            "text/html; charset=utf-8"
        );
        // Tag prefix without a terminator is not HTML.
        assert_eq!(detect_content_type(b"<Bold"), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_mp4() {
        let mut data = vec![0, 0, 0, 16];
        data.extend_from_slice(b"ftypisom");
        data.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(detect_content_type(&data), OCTET_STREAM);

        let mut data = vec![0, 0, 0, 20];
        data.extend_from_slice(b"ftypisom");
        data.extend_from_slice(&[0, 0, 2, 0]);
        data.extend_from_slice(b"mp41");
        assert_eq!(detect_content_type(&data), "video/mp4");
    }

    #[test]
    fn test_binary_fallback() {
        assert_eq!(detect_content_type(&[0x01, 0x02, 0x03]), OCTET_STREAM);
        assert_eq!(
            detect_content_type(b"plain words\r\n\ttabbed"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_only_prefix_considered() {
        let mut data = vec![b'a'; SNIFF_LEN];
        data.push(0x00);
        assert_eq!(detect_content_type(&data), "text/plain; charset=utf-8");
    }
}
