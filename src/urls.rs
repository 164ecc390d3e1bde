//! URL helpers: key percent-encoding and signing-parameter stripping.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

/// Characters left untouched when a key is placed in a URL path.
const KEY_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/')
    .remove(b'!')
    .remove(b'*')
    .remove(b'(')
    .remove(b')')
    .remove(b'\'');

/// Query parameters that carry a request signature (compared lowercase).
const SIGNING_PARAMETERS: &[&str] = &[
    "x-amz-algorithm",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-signedheaders",
    "x-amz-signature",
    "x-amz-security-token",
    "awsaccesskeyid",
    "expires",
    "signature",
];

/// Percent-encode a key for use as a URL path.
///
/// Backslashes are turned into forward slashes first.  Non-ASCII
/// characters are encoded as their UTF-8 bytes.
pub fn filepath_to_uri(path: &str) -> String {
    utf8_percent_encode(&path.replace('\\', "/"), KEY_PATH_ENCODE_SET).to_string()
}

/// Remove signature query parameters from a presigned URL.
///
/// Other query parameters are kept in order.  A URL that cannot be
/// parsed is returned unchanged.
pub fn strip_signing_parameters(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !SIGNING_PARAMETERS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}
