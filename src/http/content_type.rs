// # Content Types
//
// Header values are matched against the set of types and subtypes the
// engine knows what to do with. Anything else is preserved as the raw
// header string.

/// Recognized top-level media types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Any,
    Application,
    Audio,
    Image,
    Message,
    Multipart,
    Text,
    Video,
    Software,
    Other,
}

/// Recognized subtypes across all top-level types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSubtype {
    Any,
    // text
    Html,
    Plain,
    Enriched,
    Xml,
    Pdf,
    // application
    SoapXml,
    Dime,
    WwwFormUrlencoded,
    Msword,
    Postscript,
    Rtf,
    Zip,
    OctetStream,
    Wordperfect,
    Excel,
    Powerpoint,
    XComet,
    // image
    Gif,
    Jpeg,
    XBitmap,
    Pjpeg,
    // message
    Rfc822,
    Partial,
    External,
    // multipart
    Mixed,
    Parallel,
    Digest,
    Alternative,
    Appledouble,
    // video
    Mpeg,
    Quicktime,
    Msvideo,
    Avi,
    Wmv,
    // audio
    Basic,
    Wav,
    Wma,
    Rma,
    Mp3,
    Asf,
    Other,
}

const KINDS: &[(&str, ContentKind)] = &[
    ("*", ContentKind::Any),
    ("application", ContentKind::Application),
    ("audio", ContentKind::Audio),
    ("image", ContentKind::Image),
    ("message", ContentKind::Message),
    ("multipart", ContentKind::Multipart),
    ("text", ContentKind::Text),
    ("video", ContentKind::Video),
    ("software", ContentKind::Software),
];

const SUBTYPES: &[(&str, ContentSubtype)] = &[
    ("*", ContentSubtype::Any),
    ("html", ContentSubtype::Html),
    ("plain", ContentSubtype::Plain),
    ("enriched", ContentSubtype::Enriched),
    ("xml", ContentSubtype::Xml),
    ("pdf", ContentSubtype::Pdf),
    ("soap+xml", ContentSubtype::SoapXml),
    ("dime", ContentSubtype::Dime),
    ("x-www-form-urlencoded", ContentSubtype::WwwFormUrlencoded),
    ("msword", ContentSubtype::Msword),
    ("postscript", ContentSubtype::Postscript),
    ("rtf", ContentSubtype::Rtf),
    ("zip", ContentSubtype::Zip),
    ("octet-stream", ContentSubtype::OctetStream),
    ("wordperfect5.1", ContentSubtype::Wordperfect),
    ("vnd.ms-excel", ContentSubtype::Excel),
    ("vnd.ms-powerpoint", ContentSubtype::Powerpoint),
    ("x-comet", ContentSubtype::XComet),
    ("gif", ContentSubtype::Gif),
    ("jpeg", ContentSubtype::Jpeg),
    ("x-xbitmap", ContentSubtype::XBitmap),
    ("pjpeg", ContentSubtype::Pjpeg),
    ("rfc822", ContentSubtype::Rfc822),
    ("partial", ContentSubtype::Partial),
    ("external", ContentSubtype::External),
    ("mixed", ContentSubtype::Mixed),
    ("parallel", ContentSubtype::Parallel),
    ("digest", ContentSubtype::Digest),
    ("alternative", ContentSubtype::Alternative),
    ("appledouble", ContentSubtype::Appledouble),
    ("mpeg", ContentSubtype::Mpeg),
    ("quicktime", ContentSubtype::Quicktime),
    ("x-msvideo", ContentSubtype::Msvideo),
    ("avi", ContentSubtype::Avi),
    ("wmv", ContentSubtype::Wmv),
    ("mpg", ContentSubtype::Mpeg),
    ("basic", ContentSubtype::Basic),
    ("wav", ContentSubtype::Wav),
    ("wma", ContentSubtype::Wma),
    ("rma", ContentSubtype::Rma),
    ("mp3", ContentSubtype::Mp3),
    ("asf", ContentSubtype::Asf),
];

/// A parsed Content-Type header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub kind: ContentKind,
    pub subtype: ContentSubtype,
    pub charset: Option<String>,
    /// The header value as received, for the cases the tables do not
    /// cover.
    pub raw: String,
}

impl MediaType {
    pub fn new(kind: ContentKind, subtype: ContentSubtype) -> Self {
        Self {
            kind,
            subtype,
            charset: None,
            raw: String::new(),
        }
    }

    /// The wire spelling of a recognized type/subtype pair.
    pub fn to_header_value(&self) -> String {
        if !self.raw.is_empty() {
            return self.raw.clone();
        }
        let kind = KINDS
            .iter()
            .find(|(_, k)| *k == self.kind)
            .map(|(s, _)| *s)
            .unwrap_or("application");
        let subtype = SUBTYPES
            .iter()
            .find(|(_, s)| *s == self.subtype)
            .map(|(s, _)| *s)
            .unwrap_or("octet-stream");
        match &self.charset {
            Some(cs) => format!("{}/{}; charset={}", kind, subtype, cs),
            None => format!("{}/{}", kind, subtype),
        }
    }
}

/// Parse a Content-Type header value. Never fails: unrecognized types
/// come back as `Other` with the raw text preserved.
pub fn parse_content_type(value: &str) -> MediaType {
    let raw = value.trim().to_string();
    let mut sections = raw.split(';');
    let type_part = sections.next().unwrap_or("").trim();

    let (kind_text, subtype_text) = match type_part.split_once('/') {
        Some((k, s)) => (k.trim(), s.trim()),
        None => (type_part, ""),
    };

    let kind = KINDS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(kind_text))
        .map(|(_, k)| *k)
        .unwrap_or(ContentKind::Other);
    let subtype = SUBTYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(subtype_text))
        .map(|(_, s)| *s)
        .unwrap_or(ContentSubtype::Other);

    let mut charset = None;
    for param in sections {
        let param = param.trim();
        if let Some((name, val)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("charset") {
                charset = Some(val.trim().trim_matches('"').to_string());
            }
        }
    }

    MediaType {
        kind,
        subtype,
        charset,
        raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_types() {
        let html = parse_content_type("text/html");
        assert_eq!(html.kind, ContentKind::Text);
        assert_eq!(html.subtype, ContentSubtype::Html);

        let jpeg = parse_content_type("image/jpeg");
        assert_eq!(jpeg.kind, ContentKind::Image);
        assert_eq!(jpeg.subtype, ContentSubtype::Jpeg);

        let form = parse_content_type("application/x-www-form-urlencoded");
        assert_eq!(form.kind, ContentKind::Application);
        assert_eq!(form.subtype, ContentSubtype::WwwFormUrlencoded);
    }

    #[test]
    fn test_charset_parameter() {
        let parsed = parse_content_type("text/html; charset=UTF-8");
        assert_eq!(parsed.subtype, ContentSubtype::Html);
        assert_eq!(parsed.charset.as_deref(), Some("UTF-8"));

        let quoted = parse_content_type("text/plain; charset=\"iso-8859-1\"");
        assert_eq!(quoted.charset.as_deref(), Some("iso-8859-1"));
    }

    #[test]
    fn test_wildcards() {
        let anything = parse_content_type("*/*");
        assert_eq!(anything.kind, ContentKind::Any);
        assert_eq!(anything.subtype, ContentSubtype::Any);
    }

    #[test]
    fn test_unknown_preserved_raw() {
        let odd = parse_content_type("chemical/x-pdb; note=molecule");
        assert_eq!(odd.kind, ContentKind::Other);
        assert_eq!(odd.subtype, ContentSubtype::Other);
        assert_eq!(odd.raw, "chemical/x-pdb; note=molecule");
    }

    #[test]
    fn test_emission_round_trip() {
        let mt = MediaType::new(ContentKind::Text, ContentSubtype::Plain);
        assert_eq!(mt.to_header_value(), "text/plain");

        let mut with_charset = MediaType::new(ContentKind::Text, ContentSubtype::Html);
        with_charset.charset = Some("utf-8".to_string());
        assert_eq!(with_charset.to_header_value(), "text/html; charset=utf-8");
    }
}
