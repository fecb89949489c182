use std::{fmt, slice, str};

/// RFC 2616 的分隔字元，不可出現在標頭名稱中。
const fn is_separator(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'\t'
            | b'('
            | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
    )
}

const fn build_token_map() -> [bool; 256] {
    let mut map = [false; 256];
    let mut b = 0x21;
    while b < 0x7f {
        map[b] = !is_separator(b as u8);
        b += 1;
    }
    map
}

// 可見 US-ASCII 扣除分隔字元；控制字元與 0x80 以上皆為 false
static TOKEN_MAP: [bool; 256] = build_token_map();

#[inline]
pub fn is_token_char(b: u8) -> bool {
    TOKEN_MAP[b as usize]
}

pub fn is_token(name: &[u8]) -> bool {
    !name.is_empty() && name.iter().all(|&b| is_token_char(b))
}

fn trim_leading_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: Vec<u8>,
}

impl Header {
    pub fn new(name: &str, value: impl Into<Vec<u8>>) -> Option<Self> {
        if !is_token(name.as_bytes()) {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            value: value.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_str(&self) -> Option<&str> {
        str::from_utf8(&self.value).ok()
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// 將折行（以空白或 Tab 開頭的行）原封不動地接到值的後面。
    pub(crate) fn append_continuation(&mut self, line: &[u8]) {
        self.value.extend_from_slice(line);
    }

    /// 該標頭不會再有折行時，去掉值尾端的空白與 Tab。
    pub(crate) fn trim_trailing_ows(&mut self) {
        while let Some(b' ' | b'\t') = self.value.last() {
            self.value.pop();
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, String::from_utf8_lossy(&self.value))
    }
}

/// 嘗試將一行（不含行結尾）解析為標頭。
///
/// 沒有冒號或名稱含有非 token 字元時回傳 `None`，由呼叫端直接略過該行。
/// 這裡只去掉值前端的空白；尾端要等折行都接上後才處理。
pub fn try_parse_header_line(line: &[u8]) -> Option<Header> {
    let colon = line.iter().position(|&b| b == b':')?;
    let (name, rest) = line.split_at(colon);
    if !is_token(name) {
        return None;
    }

    Some(Header {
        name: str::from_utf8(name).ok()?.to_string(),
        value: trim_leading_ows(&rest[1..]).to_vec(),
    })
}

/// 單一請求的標頭集合，保留到達順序與重複名稱。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.is_named(name))
            .map(Header::value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| str::from_utf8(v).ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.headers
            .iter()
            .filter(move |h| h.is_named(name))
            .map(Header::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.is_named(name))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Header> {
        self.headers.iter()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Header> {
        self.headers.last_mut()
    }
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = &'a Header;
    type IntoIter = slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
