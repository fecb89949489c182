pub mod http_date;
pub mod http_header;
pub mod http_request;

/// 回傳第一個行結尾（`\n`）的位置，以及該行內容（不含 `\r\n` 或 `\n`）的長度。
fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    let content_len = if lf > 0 && buf[lf - 1] == b'\r' {
        lf - 1
    } else {
        lf
    };
    Some((lf, content_len))
}

fn is_fold_start(line: &[u8]) -> bool {
    matches!(line.first(), Some(b' ' | b'\t'))
}
