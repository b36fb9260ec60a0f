//! Response assembly: turn the procedure's text output back into an HTTP
//! response, or recognize a file download and pass the blob through.
//!
//! Header scan runs line by line from the top of the stream. Recognized
//! header lines never reach the body; the first blank line closes the
//! header section; a non-header line closes it too and belongs to the
//! body (procedures that print no headers at all get a text/html page).

use bytes::Bytes;

use crate::error::GatewayResult;
use crate::stream::PageStream;

/// Parsed header section of a rendered page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageHead {
    pub cookies: Vec<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub status_code: Option<u16>,
    pub status_reason: Option<String>,
    pub redirect_location: Option<String>,
    pub other: Vec<(String, String)>,
}

impl PageHead {
    /// Effective response status: explicit `Status:` wins, a `Location:`
    /// header implies a redirect, everything else is 200.
    pub fn effective_status(&self) -> u16 {
        if let Some(code) = self.status_code {
            return code;
        }
        if self.redirect_location.is_some() {
            return 302;
        }
        200
    }

    pub fn effective_content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or("text/html")
    }
}

/// Binary download payload: MIME type, declared size, blob.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePayload {
    pub file_type: String,
    pub size: i64,
    pub blob: Bytes,
}

/// Fully assembled response. `body` and `file` are mutually exclusive:
/// a download bypasses header/body parsing entirely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    pub head: PageHead,
    pub body: String,
    pub file: Option<FilePayload>,
}

impl PageResult {
    pub fn from_file(file: FilePayload) -> Self {
        PageResult { head: PageHead::default(), body: String::new(), file: Some(file) }
    }
}

/// Incremental header scanner. Feed lines in order; while the header
/// section is open, recognized lines are absorbed and `feed` returns
/// `None`. The first blank or unrecognizable line closes the section and
/// every line from there on (including that one, when non-blank) comes
/// back as body.
#[derive(Debug, Default)]
pub struct HeadScanner {
    head: PageHead,
    done: bool,
}

impl HeadScanner {
    pub fn new() -> Self {
        HeadScanner::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_head(self) -> PageHead {
        self.head
    }

    pub fn head(&self) -> &PageHead {
        &self.head
    }

    pub fn feed(&mut self, line: &str) -> Option<String> {
        if self.done {
            return Some(line.to_string());
        }
        if line.is_empty() {
            self.done = true;
            return None;
        }
        if self.absorb_header(line) {
            return None;
        }
        self.done = true;
        Some(line.to_string())
    }

    fn absorb_header(&mut self, line: &str) -> bool {
        let Some(colon) = line.find(':') else { return false };
        let token = &line[..colon];
        if token.is_empty()
            || !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return false;
        }
        // values taken verbatim except one optional leading space
        let value = line[colon + 1..].strip_prefix(' ').unwrap_or(&line[colon + 1..]);
        match token.to_ascii_lowercase().as_str() {
            "content-type" => self.head.content_type = Some(value.to_string()),
            "set-cookie" => self.head.cookies.push(value.to_string()),
            "location" => self.head.redirect_location = Some(value.to_string()),
            "x-db-content-length" => self.head.content_length = value.trim().parse().ok(),
            "status" => match value.split_once(' ') {
                Some((code, reason)) => {
                    self.head.status_code = code.trim().parse().ok();
                    self.head.status_reason = Some(reason.trim().to_string());
                }
                None => self.head.status_code = value.trim().parse().ok(),
            },
            _ => self.head.other.push((token.to_string(), value.to_string())),
        }
        true
    }
}

/// Pull chunks from the stream until the header section closes, returning
/// the head plus any body lines already fetched. Remaining output stays
/// in the stream for the caller to drain.
pub async fn assemble_head(stream: &mut PageStream) -> GatewayResult<(PageHead, Vec<String>)> {
    let mut scanner = HeadScanner::new();
    let mut leftover = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        for line in chunk {
            if let Some(body_line) = scanner.feed(&line) {
                leftover.push(body_line);
            }
        }
        if scanner.is_done() {
            break;
        }
    }
    Ok((scanner.into_head(), leftover))
}

/// Parse a complete output text; convenience for the buffered path and
/// for tests.
pub fn assemble_text(lines: &[String]) -> PageResult {
    let mut scanner = HeadScanner::new();
    let mut body = Vec::new();
    for line in lines {
        if let Some(b) = scanner.feed(line) {
            body.push(b);
        }
    }
    PageResult { head: scanner.into_head(), body: body.join("\n"), file: None }
}
