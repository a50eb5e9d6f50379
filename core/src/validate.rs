use url::Url;

use crate::error::{CoreError, CoreResult};

const MAX_FILENAME_CHARS: usize = 255;
const FALLBACK_FILENAME: &str = "download";

/// Accepts absolute `http`/`https` URLs with a host.
pub fn validate_url(raw: &str) -> CoreResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("empty URL".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| CoreError::Validation(format!("{}: {}", trimmed, err)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CoreError::Validation(format!(
                "unsupported scheme {}: {}",
                other, trimmed
            )))
        }
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(CoreError::Validation(format!("missing host: {}", trimmed)));
    }
    Ok(parsed)
}

/// Last path segment, percent-decoded, or `download` when there is none.
pub fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .map(percent_decode)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

/// Makes `name` safe as a single path component.
///
/// Reserved characters (`<>:"/\|?*`) and control characters become `_`,
/// whitespace runs collapse to one space, the result is trimmed and cut to 255
/// characters. Empty results and the `.`/`..` components become `download`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for ch in name.chars() {
        if ch.is_whitespace() && !ch.is_control() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if ch.is_control() || matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
            out.push('_');
        } else {
            out.push(ch);
        }
    }

    let cut: String = out.trim().chars().take(MAX_FILENAME_CHARS).collect();
    let cut = cut.trim_end().to_string();
    if cut.is_empty() || cut == "." || cut == ".." {
        return FALLBACK_FILENAME.to_string();
    }
    cut
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).ok();
            if let Some(value) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                out.push(value);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
