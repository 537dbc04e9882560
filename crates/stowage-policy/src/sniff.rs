use stowage_core::PolicyViolation;

/// Detected kind of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kind {
    pub mime: &'static str,
    pub extension: &'static str,
    /// Other declared types accepted for this kind.
    pub aliases: &'static [&'static str],
}

const fn kind(mime: &'static str, extension: &'static str) -> Kind {
    Kind {
        mime,
        extension,
        aliases: &[],
    }
}

const fn aliased(mime: &'static str, extension: &'static str, aliases: &'static [&'static str]) -> Kind {
    Kind {
        mime,
        extension,
        aliases,
    }
}

/// Detect the kind of a stream from its magic numbers.
pub fn detect(data: &[u8]) -> Option<Kind> {
    let at = |offset: usize, magic: &[u8]| data.get(offset..offset + magic.len()) == Some(magic);

    // Images
    if at(0, &[0xFF, 0xD8, 0xFF]) {
        return Some(kind("image/jpeg", "jpg"));
    }
    if at(0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(kind("image/png", "png"));
    }
    if at(0, b"GIF8") {
        return Some(kind("image/gif", "gif"));
    }
    if at(0, b"RIFF") && at(8, b"WEBP") {
        return Some(kind("image/webp", "webp"));
    }
    if at(0, b"BM") && data.len() > 14 {
        return Some(kind("image/bmp", "bmp"));
    }
    if at(0, &[b'I', b'I', 0x2A, 0x00]) || at(0, &[b'M', b'M', 0x00, 0x2A]) {
        return Some(kind("image/tiff", "tif"));
    }

    // ISO base media: the major brand decides.
    if at(4, b"ftyp") {
        return data.get(8..12).map(iso_brand);
    }

    // Audio
    if at(0, b"RIFF") && at(8, b"WAVE") {
        return Some(aliased("audio/x-wav", "wav", &["audio/wav", "audio/wave"]));
    }
    if at(0, b"ID3") {
        return Some(aliased("audio/mpeg", "mp3", &["audio/mp3"]));
    }
    if data.len() > 1 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0 {
        // Frame sync; layer bits `00` mark an ADTS (AAC) header.
        return Some(if data[1] & 0x06 == 0 {
            aliased("audio/aac", "aac", &["audio/x-aac"])
        } else {
            aliased("audio/mpeg", "mp3", &["audio/mp3"])
        });
    }
    if at(0, b"OggS") {
        return Some(kind("audio/ogg", "ogg"));
    }
    if at(0, b"fLaC") {
        return Some(aliased("audio/x-flac", "flac", &["audio/flac"]));
    }
    if at(0, b"#!AMR") {
        return Some(kind("audio/amr", "amr"));
    }

    // Video
    if at(0, &[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(if data.windows(4).any(|w| w == b"webm") {
            aliased("video/webm", "webm", &["audio/webm"])
        } else {
            kind("video/x-matroska", "mkv")
        });
    }
    if at(0, b"RIFF") && at(8, b"AVI ") {
        return Some(kind("video/x-msvideo", "avi"));
    }

    // Documents and archives
    if at(0, b"%PDF") {
        return Some(kind("application/pdf", "pdf"));
    }
    if at(0, &[b'P', b'K', 0x03, 0x04]) {
        return Some(kind("application/zip", "zip"));
    }
    if at(0, &[0x1F, 0x8B, 0x08]) {
        return Some(kind("application/gzip", "gz"));
    }

    None
}

fn iso_brand(brand: &[u8]) -> Kind {
    match brand {
        b"qt  " => kind("video/quicktime", "mov"),
        b"M4A " | b"M4B " => aliased("audio/mp4", "m4a", &["audio/x-m4a", "audio/m4a"]),
        b"M4V " | b"M4VH" | b"M4VP" => aliased("video/x-m4v", "m4v", &["video/mp4"]),
        b"heic" | b"heix" | b"heim" | b"heis" | b"hevc" | b"hevx" | b"mif1" | b"msf1" => {
            aliased("image/heif", "heic", &["image/heic", "image/heif-sequence", "image/heic-sequence"])
        }
        b"avif" | b"avis" => kind("image/avif", "avif"),
        [b'3', b'g', ..] => aliased("video/3gpp", "3gp", &["video/3gpp2", "audio/3gpp", "audio/3gpp2"]),
        _ => aliased("video/mp4", "mp4", &["audio/mp4"]),
    }
}

/// Check the leading bytes of a stream against its declared MIME type.
///
/// The detected type (or one of its aliases) must be a prefix of the declared
/// one, so a declared `audio/wav` is accepted for anything detected as WAV.
pub fn check_content_type(declared: &str, head: &[u8]) -> Result<(), PolicyViolation> {
    let detected = detect(head).ok_or(PolicyViolation::UnknownType)?;

    if declared.starts_with(detected.mime)
        || detected.aliases.iter().any(|alias| declared.starts_with(alias))
    {
        return Ok(());
    }

    Err(PolicyViolation::SuspiciousType {
        declared: declared.to_string(),
        detected: detected.mime.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
    const WAV: &[u8] = b"RIFF\x24\x08\x00\x00WAVEfmt ";

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut head = b"\x00\x00\x00\x18ftyp".to_vec();
        head.extend_from_slice(brand);
        head.extend_from_slice(b"\x00\x00\x02\x00isom");
        head
    }

    fn mime(data: &[u8]) -> Option<&'static str> {
        detect(data).map(|k| k.mime)
    }

    #[test]
    fn test_detect() {
        assert_eq!(mime(PNG), Some("image/png"));
        assert_eq!(detect(WAV).map(|k| k.extension), Some("wav"));
        assert_eq!(mime(b"ID3\x04\x00"), Some("audio/mpeg"));
        assert_eq!(mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(mime(&[0xFF]), None);
        assert_eq!(mime(b""), None);
    }

    #[test]
    fn test_iso_brands() {
        assert_eq!(mime(&ftyp(b"mp42")), Some("video/mp4"));
        assert_eq!(mime(&ftyp(b"isom")), Some("video/mp4"));
        assert_eq!(mime(&ftyp(b"qt  ")), Some("video/quicktime"));
        assert_eq!(mime(&ftyp(b"M4A ")), Some("audio/mp4"));
        assert_eq!(mime(&ftyp(b"heic")), Some("image/heif"));
        assert_eq!(mime(&ftyp(b"3gp5")), Some("video/3gpp"));
        assert_eq!(mime(&ftyp(b"avif")), Some("image/avif"));
        // Truncated before the brand.
        assert_eq!(mime(b"\x00\x00\x00\x18ftyp"), None);
    }

    #[test]
    fn test_frame_sync_layers() {
        assert_eq!(mime(&[0xFF, 0xFB, 0x90, 0x00]), Some("audio/mpeg"));
        assert_eq!(mime(&[0xFF, 0xF1, 0x50, 0x80]), Some("audio/aac"));
        assert_eq!(mime(&[0xFF, 0xF9, 0x50, 0x80]), Some("audio/aac"));
    }

    #[test]
    fn test_container_types_match_their_declared_mime() {
        assert!(check_content_type("video/quicktime", &ftyp(b"qt  ")).is_ok());
        assert!(check_content_type("image/heic", &ftyp(b"heic")).is_ok());
        assert!(check_content_type("video/3gpp", &ftyp(b"3gp4")).is_ok());
        assert!(check_content_type("audio/x-m4a", &ftyp(b"M4A ")).is_ok());
        assert!(check_content_type("audio/mp4", &ftyp(b"M4A ")).is_ok());
        assert!(check_content_type("audio/aac", &[0xFF, 0xF1, 0x50, 0x80]).is_ok());
        assert!(check_content_type("video/webm", b"\x1A\x45\xDF\xA3\x9F\x42\x82\x84webm").is_ok());

        assert!(matches!(
            check_content_type("video/quicktime", &ftyp(b"heic")),
            Err(PolicyViolation::SuspiciousType { .. })
        ));
    }

    #[test]
    fn test_matching_type() {
        assert!(check_content_type("image/png", PNG).is_ok());
        assert!(check_content_type("audio/mp3", b"ID3\x04\x00").is_ok());
    }

    #[test]
    fn test_wav_exception() {
        assert!(check_content_type("audio/wav", WAV).is_ok());
        assert!(check_content_type("audio/x-wav", WAV).is_ok());
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            check_content_type("text/plain", b"just some words"),
            Err(PolicyViolation::UnknownType)
        );
    }

    #[test]
    fn test_suspicious_type() {
        let err = check_content_type("audio/mpeg", PNG).unwrap_err();
        assert_eq!(
            err,
            PolicyViolation::SuspiciousType {
                declared: "audio/mpeg".to_string(),
                detected: "image/png".to_string(),
            }
        );
    }
}
