//! `Accept` header negotiation for image responses.
//!
//! Only PNG and JPEG are ever served and bytes are never transcoded. The
//! client must name one of them explicitly: a missing header, wildcards
//! alone, or any other type is a 406.

use drishti_core::{Error, ImageFormat, Result};

const CANDIDATES: [ImageFormat; 2] = [ImageFormat::Png, ImageFormat::Jpeg];

struct MediaRange<'a> {
    kind: &'a str,
    subtype: &'a str,
    q: f32,
}

fn parse_accept(header: &str) -> Vec<MediaRange<'_>> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let range = pieces.next()?.trim();
            let (kind, subtype) = range.split_once('/')?;
            let mut q = 1.0;
            for param in pieces {
                if let Some((name, value)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = value.trim().parse::<f32>().unwrap_or(0.0).clamp(0.0, 1.0);
                    }
                }
            }
            Some(MediaRange {
                kind: kind.trim(),
                subtype: subtype.trim(),
                q,
            })
        })
        .collect()
}

fn subtypes(format: ImageFormat) -> &'static [&'static str] {
    match format {
        ImageFormat::Png => &["png"],
        ImageFormat::Jpeg => &["jpeg", "jpg"],
    }
}

/// Highest q-value among the ranges naming `format`. Wildcards never match.
fn quality(ranges: &[MediaRange<'_>], format: ImageFormat) -> Option<f32> {
    ranges
        .iter()
        .filter(|r| {
            r.kind.eq_ignore_ascii_case("image")
                && subtypes(format).iter().any(|s| r.subtype.eq_ignore_ascii_case(s))
        })
        .map(|r| r.q)
        .max_by(|a, b| a.total_cmp(b))
}

/// Pick the response format for an `Accept` header.
///
/// The highest q-value wins; `q=0` excludes a type. Ties go to `stored`,
/// the format the image is kept in, then to PNG.
pub fn negotiate_image(accept: Option<&str>, stored: Option<ImageFormat>) -> Result<ImageFormat> {
    let header = accept.map(str::trim).unwrap_or_default();
    if header.is_empty() {
        return Err(Error::NotAcceptable(
            "Client does not accept an image format".to_string(),
        ));
    }

    let ranges = parse_accept(header);
    let mut best: Option<(ImageFormat, f32)> = None;
    for format in CANDIDATES {
        let Some(q) = quality(&ranges, format) else {
            continue;
        };
        if q <= 0.0 {
            continue;
        }
        best = match best {
            None => Some((format, q)),
            Some((_, best_q)) if q > best_q => Some((format, q)),
            Some((_, best_q)) if q == best_q && Some(format) == stored => Some((format, q)),
            keep => keep,
        };
    }

    best.map(|(format, _)| format).ok_or_else(|| {
        Error::NotAcceptable("Client does not accept an image format".to_string())
    })
}

/// Format implied by a storage key's extension
pub fn format_of_key(key: &str) -> Option<ImageFormat> {
    let ext = key.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}
