//! Shared HTTP helpers for provider clients
//!
//! Maps provider responses onto [`BackendError`] and unwraps WAV
//! containers into raw PCM.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use super::{AudioFormat, AudioPayload, BackendError};

/// Classify a non-success HTTP status into a [`BackendError`].
///
/// 429 is a rate limit, 401/403 are credential problems, 408 and 5xx are
/// worth retrying, and every other status means the request itself is bad.
#[must_use]
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> BackendError {
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 200))
    };

    match status {
        429 => BackendError::RateLimited { retry_after },
        401 | 403 => BackendError::Auth(detail),
        408 | 500..=599 => BackendError::Transient(detail),
        _ => BackendError::Permanent(detail),
    }
}

/// Extract a `Retry-After` delay given in seconds.
///
/// HTTP-date values are ignored; backoff takes over in that case.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Classify a transport-level failure from `reqwest`
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> BackendError {
    if err.is_builder() {
        BackendError::Permanent(err.to_string())
    } else {
        BackendError::Transient(err.to_string())
    }
}

/// Turn a failed response into a [`BackendError`], passing successes through
pub async fn check_response(
    response: reqwest::Response,
    provider: &str,
) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let err = classify_status(status.as_u16(), retry_after, &body);
    tracing::debug!(provider, status = status.as_u16(), error = %err, "provider rejected request");
    Err(err)
}

/// Strip a RIFF/WAVE container and return its PCM frames.
///
/// Bytes that are not a WAV file are taken as raw PCM in `fallback` format.
/// Streaming providers often write a placeholder data length, so the
/// declared length is only trusted when it fits inside the body.
///
/// # Errors
///
/// Returns [`BackendError::Permanent`] for malformed or non-PCM WAV data
pub fn pcm_from_wav(bytes: &[u8], fallback: AudioFormat) -> Result<AudioPayload, BackendError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Ok(AudioPayload::new(fallback, bytes.to_vec()));
    }

    let mut format = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let declared = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let body_start = pos + 8;

        match id {
            b"fmt " => {
                let end = body_start.saturating_add(declared).min(bytes.len());
                format = Some(parse_fmt(&bytes[body_start..end])?);
            }
            b"data" => {
                let format = format.ok_or_else(|| {
                    BackendError::Permanent("WAV data chunk before fmt chunk".to_string())
                })?;
                let body = &bytes[body_start..];
                let mut len = declared.min(body.len());
                len -= len % format.frame_bytes().max(1);
                return Ok(AudioPayload::new(format, body[..len].to_vec()));
            }
            _ => {}
        }

        // Chunks are padded to an even length
        pos = body_start.saturating_add(declared).saturating_add(declared % 2);
    }

    Err(BackendError::Permanent("WAV audio has no data chunk".to_string()))
}

fn parse_fmt(chunk: &[u8]) -> Result<AudioFormat, BackendError> {
    if chunk.len() < 16 {
        return Err(BackendError::Permanent("truncated WAV fmt chunk".to_string()));
    }
    let mut tag = u16::from_le_bytes([chunk[0], chunk[1]]);
    let channels = u16::from_le_bytes([chunk[2], chunk[3]]);
    let rate = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
    let bits = u16::from_le_bytes([chunk[14], chunk[15]]);

    // WAVE_FORMAT_EXTENSIBLE carries the real tag at the start of the sub-format GUID
    if tag == 0xFFFE && chunk.len() >= 26 {
        tag = u16::from_le_bytes([chunk[24], chunk[25]]);
    }

    if tag != 1 || bits == 0 || bits % 8 != 0 || channels == 0 {
        return Err(BackendError::Permanent(format!(
            "unsupported WAV encoding: tag {tag:#x}, {bits} bits, {channels} channels"
        )));
    }

    Ok(AudioFormat {
        rate,
        width: bits / 8,
        channels,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
