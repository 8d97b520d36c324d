//! AMP HTML armor.
//!
//! A cache will only serve documents that validate as AMP, and it may
//! reflow whitespace while doing so. The broker therefore wraps a response
//! blob as base64 inside `<pre>` elements of a minimal valid AMP page; the
//! decoder here recovers the blob no matter how the cache re-wrapped it.
//! The encoder is the broker-side counterpart, kept so the decoder can be
//! proven against it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{ClientError, Result};

const AMP_HEAD: &str = "<!doctype html>\n\
<html amp>\n\
<head>\n\
<meta charset=\"utf-8\">\n\
<script async src=\"https://cdn.ampproject.org/v0.js\"></script>\n\
<link rel=\"canonical\" href=\"#\">\n\
<meta name=\"viewport\" content=\"width=device-width\">\n\
<style amp-boilerplate>body{-webkit-animation:-amp-start 8s steps(1,end) 0s 1 normal both;-moz-animation:-amp-start 8s steps(1,end) 0s 1 normal both;-ms-animation:-amp-start 8s steps(1,end) 0s 1 normal both;animation:-amp-start 8s steps(1,end) 0s 1 normal both}@-webkit-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-moz-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-ms-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-o-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}</style><noscript><style amp-boilerplate>body{-webkit-animation:none;-moz-animation:none;-ms-animation:none;animation:none}</style></noscript>\n\
</head>\n\
<body>\n";

const AMP_TAIL: &str = "</body>\n</html>\n";

const LINE_WIDTH: usize = 64;

/// Wraps `data` into an AMP HTML page. The payload is a whitespace-
/// delimited `'0'` version indicator followed by line-wrapped standard
/// base64, all inside a `<pre>` element.
pub fn armor_encode(data: &[u8]) -> String {
    let b64 = STANDARD.encode(data);
    let mut page = String::with_capacity(AMP_HEAD.len() + b64.len() + b64.len() / LINE_WIDTH + 64);
    page.push_str(AMP_HEAD);
    page.push_str("<pre>\n0\n");
    for chunk in b64.as_bytes().chunks(LINE_WIDTH) {
        // chunks of an ASCII string stay ASCII
        page.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        page.push('\n');
    }
    page.push_str("</pre>\n");
    page.push_str(AMP_TAIL);
    page
}

/// Extracts the armored payload from an AMP page: concatenate the contents
/// of every `<pre>` element, split on whitespace, check the leading `"0"`
/// version word, and base64-decode the rest.
pub fn armor_decode(html: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(html)
        .map_err(|_| ClientError::Rendezvous("armored response is not UTF-8".to_string()))?;
    let lower = text.to_ascii_lowercase();

    let mut payload = String::new();
    let mut pos = 0;
    while let Some(offset) = lower[pos..].find("<pre") {
        let tag_start = pos + offset;
        let open_end = lower[tag_start..]
            .find('>')
            .ok_or_else(|| ClientError::Rendezvous("unterminated <pre> tag".to_string()))?;
        let content_start = tag_start + open_end + 1;
        let content_len = lower[content_start..]
            .find("</pre")
            .ok_or_else(|| ClientError::Rendezvous("unterminated <pre> element".to_string()))?;
        payload.push_str(&text[content_start..content_start + content_len]);
        pos = content_start + content_len + "</pre".len();
    }

    let mut words = payload.split_ascii_whitespace();
    match words.next() {
        Some("0") => {}
        Some(v) => {
            return Err(ClientError::Rendezvous(format!(
                "unknown armor version indicator {v:?}"
            )))
        }
        None => return Err(ClientError::Rendezvous("no armored payload found".to_string())),
    }
    let b64: String = words.collect();
    STANDARD
        .decode(b64)
        .map_err(|e| ClientError::Rendezvous(format!("armored payload is not base64: {e}")))
}
