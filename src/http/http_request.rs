use std::{
    collections::HashMap,
    io::{self, BufRead, Read},
    str,
};

use http::Version;
use thiserror::Error;
use tracing::debug;

use crate::core::config::TokenizerConfig;

use super::{
    find_line_end,
    http_header::{try_parse_header_line, HeaderSet},
    is_fold_start,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Request ended before the header section was complete")]
    Truncated,
    #[error("Line exceeds the maximum length of {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Complete,
}

/// 請求的第一行。本層不解讀其內容，只提供以空白切分後的欄位。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLine {
    raw: Vec<u8>,
}

impl RequestLine {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn part(&self, index: usize) -> Option<&str> {
        str::from_utf8(&self.raw).ok()?.split_whitespace().nth(index)
    }

    pub fn method(&self) -> Option<&str> {
        self.part(0)
    }

    pub fn target(&self) -> Option<&str> {
        self.part(1)
    }

    pub fn version(&self) -> Option<&str> {
        self.part(2)
    }

    pub fn http_version(&self) -> Option<Version> {
        match self.version()? {
            "HTTP/0.9" => Some(Version::HTTP_09),
            "HTTP/1.0" => Some(Version::HTTP_10),
            "HTTP/1.1" => Some(Version::HTTP_11),
            "HTTP/2" | "HTTP/2.0" => Some(Version::HTTP_2),
            "HTTP/3" | "HTTP/3.0" => Some(Version::HTTP_3),
            _ => None,
        }
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some((_, query_string)) = self.target().and_then(|t| t.split_once('?')) {
            for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
                params.insert(key.into_owned(), value.into_owned());
            }
        }
        params
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRequest {
    request_line: RequestLine,
    headers: HeaderSet,
    remaining: Vec<u8>,
}

impl ParsedRequest {
    pub fn request_line(&self) -> &RequestLine {
        &self.request_line
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    /// 標頭區段結束後已收到的位元組（通常是 body 的開頭）。
    pub fn remaining(&self) -> &[u8] {
        &self.remaining
    }

    pub fn into_parts(self) -> (RequestLine, HeaderSet, Vec<u8>) {
        (self.request_line, self.headers, self.remaining)
    }
}

/// 逐行處理的狀態機，分段餵入與 reader 兩種入口共用。
#[derive(Debug, Default)]
struct HeaderAccumulator {
    state: ParseState,
    request_line: Option<RequestLine>,
    headers: HeaderSet,
    can_fold: bool,
}

impl HeaderAccumulator {
    fn accept_line(&mut self, line: &[u8]) {
        match self.state {
            ParseState::RequestLine => {
                if !line.is_empty() {
                    self.request_line = Some(RequestLine::new(line));
                    self.state = ParseState::Headers;
                }
            }
            ParseState::Headers => self.accept_header_line(line),
            ParseState::Complete => {}
        }
    }

    fn accept_header_line(&mut self, line: &[u8]) {
        if !is_fold_start(line) {
            self.close_last_header();
        }

        if line.is_empty() {
            self.state = ParseState::Complete;
            return;
        }

        if is_fold_start(line) {
            match self.headers.last_mut() {
                Some(header) if self.can_fold => header.append_continuation(line),
                _ => debug!(
                    line = %String::from_utf8_lossy(line),
                    "Discarding continuation line without a preceding valid header"
                ),
            }
            return;
        }

        match try_parse_header_line(line) {
            Some(header) => {
                self.headers.push(header);
                self.can_fold = true;
            }
            None => {
                debug!(
                    line = %String::from_utf8_lossy(line),
                    "Discarding malformed header line"
                );
                self.can_fold = false;
            }
        }
    }

    fn close_last_header(&mut self) {
        if self.can_fold {
            if let Some(header) = self.headers.last_mut() {
                header.trim_trailing_ows();
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    fn into_request(self, remaining: Vec<u8>) -> ParseResult<ParsedRequest> {
        match (self.state, self.request_line) {
            (ParseState::Complete, Some(request_line)) => Ok(ParsedRequest {
                request_line,
                headers: self.headers,
                remaining,
            }),
            _ => {
                debug!("Request ended before the header section was complete");
                Err(ParseError::Truncated)
            }
        }
    }
}

fn check_line_length(len: usize, limit: usize) -> ParseResult<()> {
    if len > limit {
        debug!(len, limit, "Rejecting request with an over-long line");
        return Err(ParseError::LineTooLong { limit });
    }
    Ok(())
}

/// 可分段餵入位元組的請求標頭解析器。
#[derive(Debug, Default)]
pub struct HttpRequestParser {
    config: TokenizerConfig,
    buffer: Vec<u8>,
    acc: HeaderAccumulator,
}

impl HttpRequestParser {
    pub fn new(config: TokenizerConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            acc: HeaderAccumulator::default(),
        }
    }

    /// 餵入新收到的位元組。標頭區段完整時回傳 `Ok(true)`，仍需更多資料時回傳 `Ok(false)`。
    ///
    /// 完成後再餵入的位元組會原樣保留，可由 [`ParsedRequest::remaining`] 取得。
    pub fn feed(&mut self, input: &[u8]) -> ParseResult<bool> {
        self.buffer.extend_from_slice(input);
        if self.acc.is_complete() {
            return Ok(true);
        }

        let limit = self.config.max_line_length;
        let mut consumed = 0;

        while !self.acc.is_complete() {
            let Some((lf, len)) = find_line_end(&self.buffer[consumed..]) else {
                // 尾端的 CR 可能還在等後面的 LF，不算入行長
                let mut pending = self.buffer.len() - consumed;
                if self.buffer.last() == Some(&b'\r') {
                    pending -= 1;
                }
                check_line_length(pending, limit)?;
                break;
            };
            check_line_length(len, limit)?;

            self.acc.accept_line(&self.buffer[consumed..consumed + len]);
            consumed += lf + 1;
        }

        self.buffer.drain(..consumed);
        Ok(self.acc.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.acc.is_complete()
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.acc.headers
    }

    /// 結束解析。若尚未看到結束標頭區段的空行，回傳 [`ParseError::Truncated`]。
    pub fn finish(self) -> ParseResult<ParsedRequest> {
        self.acc.into_request(self.buffer)
    }
}

/// 一次解析整個請求的標頭區段。
pub fn parse_request(input: &[u8], config: TokenizerConfig) -> ParseResult<ParsedRequest> {
    let mut parser = HttpRequestParser::new(config);
    parser.feed(input)?;
    parser.finish()
}

/// 從 reader 逐行讀取標頭區段，讀到結束空行即停止，之後的位元組留在 reader 中。
pub fn read_request<R: BufRead>(
    reader: &mut R,
    config: TokenizerConfig,
) -> ParseResult<ParsedRequest> {
    let limit = config.max_line_length;
    let mut acc = HeaderAccumulator::default();
    let mut line = Vec::new();

    while !acc.is_complete() {
        line.clear();
        // 內容上限再加上 CRLF 兩個位元組
        let max_read = (limit as u64).saturating_add(2);
        let n = reader.by_ref().take(max_read).read_until(b'\n', &mut line)?;

        if line.last() != Some(&b'\n') {
            if n as u64 == max_read {
                return Err(ParseError::LineTooLong { limit });
            }
            break;
        }

        let Some((_, len)) = find_line_end(&line) else {
            break;
        };
        check_line_length(len, limit)?;
        acc.accept_line(&line[..len]);
    }

    acc.into_request(Vec::new())
}
