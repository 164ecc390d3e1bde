//! Content-type and content-encoding negotiation at write time.
//!
//! The type of an object is taken from the caller when declared, otherwise
//! guessed from the key's extension.  A key whose suffix names an encoding
//! (`.gz`, `.bz2`, ...) is stored with that `Content-Encoding` and never
//! compressed again.  When gzip is enabled, allow-listed types are
//! compressed on the fly through a [`GzipStream`].

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeSet;
use std::io::{self, Write};

/// Content type used when nothing better is known.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content types compressed by default when gzip is enabled.
pub fn default_gzip_content_types() -> BTreeSet<String> {
    [
        "text/css",
        "text/javascript",
        "application/javascript",
        "application/x-javascript",
        "image/svg+xml",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Suffixes that expand to a compound extension before lookup.
const SUFFIX_ALIASES: &[(&str, &str)] = &[
    (".svgz", ".svg.gz"),
    (".tgz", ".tar.gz"),
    (".taz", ".tar.gz"),
    (".tz", ".tar.gz"),
    (".tbz2", ".tar.bz2"),
    (".txz", ".tar.xz"),
];

/// Suffixes that name a content encoding rather than a type.
const ENCODING_SUFFIXES: &[(&str, &str)] = &[
    (".gz", "gzip"),
    (".Z", "compress"),
    (".bz2", "bzip2"),
    (".xz", "xz"),
    (".br", "br"),
];

/// Split the extension (with its dot) off the last path segment.
///
/// Leading dots of the file name do not start an extension, so
/// `.profile` has none.
fn split_ext(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    let name = &path[name_start..];
    let stem_start = name.len() - name.trim_start_matches('.').len();
    match name[stem_start..].rfind('.') {
        Some(dot) => path.split_at(name_start + stem_start + dot),
        None => (path, ""),
    }
}

/// Guess `(content_type, content_encoding)` from a key.
pub fn guess_type(name: &str) -> (Option<String>, Option<&'static str>) {
    let mut base = name.to_string();
    let mut ext = split_ext(name).1.to_string();

    while let Some((_, expanded)) = SUFFIX_ALIASES.iter().find(|(alias, _)| *alias == ext) {
        base = format!("{}{expanded}", &base[..base.len() - ext.len()]);
        ext = split_ext(&base).1.to_string();
    }

    let mut encoding = None;
    if let Some((_, enc)) = ENCODING_SUFFIXES.iter().find(|(suffix, _)| *suffix == ext) {
        encoding = Some(*enc);
        base.truncate(base.len() - ext.len());
        ext = split_ext(&base).1.to_string();
    }

    let content_type = ext
        .strip_prefix('.')
        .filter(|e| !e.is_empty())
        .and_then(|e| mime_guess::from_ext(e).first_raw())
        .map(String::from);

    (content_type, encoding)
}

/// Outcome of negotiating the headers of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub content_type: String,
    pub content_encoding: Option<String>,
    /// Whether the payload must be gzip-compressed before upload.
    pub compress: bool,
}

/// Decide content type, encoding and compression for a write to `name`.
pub fn negotiate(
    name: &str,
    declared_content_type: Option<&str>,
    gzip: bool,
    gzip_content_types: &BTreeSet<String>,
) -> Negotiated {
    let (guessed, encoding) = guess_type(name);
    let content_type = declared_content_type
        .map(String::from)
        .or(guessed)
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let mut content_encoding = encoding.map(String::from);
    let compress =
        gzip && content_encoding.is_none() && gzip_content_types.contains(&content_type);
    if compress {
        content_encoding = Some("gzip".to_string());
    }

    Negotiated {
        content_type,
        content_encoding,
        compress,
    }
}

/// Incremental gzip compressor feeding an upload buffer.
///
/// Compressed bytes are moved into the caller's buffer after each write,
/// so the stream itself only holds what the encoder has not emitted yet.
pub struct GzipStream {
    encoder: GzEncoder<Vec<u8>>,
}

impl GzipStream {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compress `data`, appending any produced bytes to `out`.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.encoder.write_all(data)?;
        out.append(self.encoder.get_mut());
        Ok(())
    }

    /// Flush the remaining compressed data and the gzip trailer into `out`.
    pub fn finish(self, out: &mut Vec<u8>) -> io::Result<()> {
        let rest = self.encoder.finish()?;
        out.extend_from_slice(&rest);
        Ok(())
    }
}

impl Default for GzipStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Gzip a complete payload.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut stream = GzipStream::new();
    stream.write(data, &mut out)?;
    stream.finish(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        GzDecoder::new(data).read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn test_guess_type_plain() {
        assert_eq!(guess_type("test_storage_save.txt"), (Some("text/plain".to_string()), None));
        assert_eq!(guess_type("test_image.jpg"), (Some("image/jpeg".to_string()), None));
        assert_eq!(guess_type("dir.v2/README"), (None, None));
        assert_eq!(guess_type(".profile"), (None, None));
    }

    #[test]
    fn test_guess_type_encodings() {
        assert_eq!(guess_type("test_storage_save.gz"), (None, Some("gzip")));
        assert_eq!(
            guess_type("backup.tar.gz"),
            (Some("application/x-tar".to_string()), Some("gzip"))
        );
        assert_eq!(
            guess_type("backup.tgz"),
            (Some("application/x-tar".to_string()), Some("gzip"))
        );
        assert_eq!(
            guess_type("logo.svgz"),
            (Some("image/svg+xml".to_string()), Some("gzip"))
        );
        assert_eq!(guess_type("dump.bz2"), (None, Some("bzip2")));
    }

    #[test]
    fn test_negotiate_declared_wins() {
        let n = negotiate("file.txt", Some("application/json"), false, &default_gzip_content_types());
        assert_eq!(n.content_type, "application/json");
        assert_eq!(n.content_encoding, None);
        assert!(!n.compress);
    }

    #[test]
    fn test_negotiate_gzip_allow_list() {
        let types = default_gzip_content_types();
        let n = negotiate("test_storage_save.css", None, true, &types);
        assert_eq!(n.content_type, "text/css");
        assert_eq!(n.content_encoding.as_deref(), Some("gzip"));
        assert!(n.compress);

        let n = negotiate("test_storage_save.txt", None, true, &types);
        assert_eq!(n.content_type, "text/plain");
        assert!(!n.compress);

        let n = negotiate("test_storage_save.css", None, false, &types);
        assert!(!n.compress);
        assert_eq!(n.content_encoding, None);
    }

    #[test]
    fn test_negotiate_encoded_key_not_recompressed() {
        let n = negotiate("test_storage_save.gz", None, true, &default_gzip_content_types());
        assert_eq!(n.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(n.content_encoding.as_deref(), Some("gzip"));
        assert!(!n.compress);
    }

    #[test]
    fn test_gzip_stream_incremental() {
        let mut out = Vec::new();
        let mut stream = GzipStream::new();
        stream.write(b"I should ", &mut out).unwrap();
        stream.write(b"be gzip'd", &mut out).unwrap();
        stream.finish(&mut out).unwrap();
        assert_eq!(gunzip(&out), b"I should be gzip'd");
    }

    #[test]
    fn test_compress_content_len() {
        let out = compress(b"I should be gzip'd").unwrap();
        assert!(!out.is_empty());
        assert_eq!(gunzip(&out), b"I should be gzip'd");
    }
}
