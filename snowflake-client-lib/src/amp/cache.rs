//! Rewriting a public URL into its AMP cache form.
//!
//! `https://example.com/path` becomes `{cache}/c/s/example.com/path`:
//! `c` is the content type ("AMP HTML document"), `s` marks an HTTPS
//! origin and is absent for plain HTTP. Caches address origins by
//! registrable domain only, so URLs carrying userinfo or an explicit
//! port cannot be represented.

use url::Url;

use crate::error::{ClientError, Result};

pub fn cache_url(pub_url: &Url, cache: &Url) -> Result<Url> {
    if !pub_url.username().is_empty() || pub_url.password().is_some() {
        return Err(ClientError::Rendezvous(
            "URL with userinfo has no AMP cache form".to_string(),
        ));
    }
    if pub_url.port().is_some() {
        return Err(ClientError::Rendezvous(
            "URL with explicit port has no AMP cache form".to_string(),
        ));
    }
    let host = pub_url
        .host_str()
        .ok_or_else(|| ClientError::Rendezvous("URL has no host".to_string()))?;

    let mut path = cache.path().trim_end_matches('/').to_string();
    path.push_str("/c");
    if pub_url.scheme() == "https" {
        path.push_str("/s");
    }
    path.push('/');
    path.push_str(host);
    path.push_str(pub_url.path());

    let mut out = cache.clone();
    out.set_path(&path);
    out.set_query(pub_url.query());
    Ok(out)
}
