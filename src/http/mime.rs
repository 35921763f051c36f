//! Suffix-based content-type selection.

/// Returns the `Content-type` for a filesystem path, decided by the
/// substring after the last `.`. Unknown or absent suffixes fall back to
/// `text/plain`.
pub fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.') {
        Some((_, suffix)) => by_suffix(suffix),
        None => "text/plain",
    }
}

fn by_suffix(suffix: &str) -> &'static str {
    match suffix {
        "doc" => "application/msword",
        "gz" => "application/x-gzip",
        "ico" => "application/x-ico",
        "gif" => "image/gif",
        "jpg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "mp3" => "audio/mp3",
        "avi" => "video/x-msvideo",
        "html" | "htm" | "css" | "js" => "text/html",
        "c" | "txt" => "text/plain",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod test {
    use super::content_type;

    #[test]
    fn content_type_uses_the_last_suffix() {
        assert_eq!("text/plain", content_type("/www/a.txt"));
        assert_eq!("image/png", content_type("/www/shot.v2.png"));
        assert_eq!("text/html", content_type("/www/index.html"));
        assert_eq!("text/html", content_type("/www/app.js"));
    }

    #[test]
    fn content_type_defaults_to_text_plain() {
        assert_eq!("text/plain", content_type("/www/Makefile"));
        assert_eq!("text/plain", content_type("/www/archive.unknown"));
    }
}
