//! HTTP 日期的格式化、解析與快取。
//!
//! 輸出一律為 RFC 1123 格式（例如 `Mon, 16 Mar 2020 14:55:26 GMT`）；
//! 輸入接受 RFC 1123、舊式 RFC 850 與 asctime 三種格式。

use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::config::DateCacheConfig;

pub const RFC1123_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// `now()` 的快照在產生後多少毫秒內可以直接重用。
pub const CURRENT_DATE_TTL_MS: i64 = 1000;

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];
const WEEKDAYS_SHORT: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];
const MONTHS_SHORT: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("Timestamp {0} ms is outside the representable date range")]
    OutOfRange(i64),
}

/// 不經快取，將毫秒時間戳格式化為 RFC 1123 字串。毫秒部分會被捨去。
pub fn format_millis(millis: i64) -> Result<String, DateError> {
    let date =
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or(DateError::OutOfRange(millis))?;
    Ok(format_date(&date))
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.format(RFC1123_FORMAT).to_string()
}

/// 不經快取，依 RFC 1123、RFC 850、asctime 的順序嘗試解析 HTTP 日期。
pub fn parse_http_date(value: &str) -> Option<i64> {
    let input = value.as_bytes();
    parse_rfc1123(input)
        .or_else(|| parse_rfc850(input))
        .or_else(|| parse_asctime(input))
}

struct DateFields {
    weekday: usize,
    year: i32,
    month: usize,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    offset_secs: i64,
}

impl DateFields {
    fn to_millis(&self) -> Option<i64> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month as u32 + 1, self.day)?;
        if date.weekday().num_days_from_monday() as usize != self.weekday {
            return None;
        }
        let utc = date
            .and_hms_opt(self.hour, self.minute, self.second)?
            .and_utc();
        Some(utc.timestamp_millis() - self.offset_secs * 1000)
    }
}

struct Scanner<'a> {
    rest: &'a [u8],
}

impl<'a> Scanner<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    fn literal(&mut self, lit: &[u8]) -> Option<()> {
        self.rest = self.rest.strip_prefix(lit)?;
        Some(())
    }

    fn spaces(&mut self) -> Option<()> {
        let n = self.rest.iter().take_while(|&&b| b == b' ').count();
        if n == 0 {
            return None;
        }
        self.rest = &self.rest[n..];
        Some(())
    }

    /// 依序嘗試各組名稱，回傳第一個符合者在組內的索引。名稱比對區分大小寫。
    fn name(&mut self, tables: &[&[&str]]) -> Option<usize> {
        for table in tables {
            for (i, name) in table.iter().enumerate() {
                if let Some(rest) = self.rest.strip_prefix(name.as_bytes()) {
                    self.rest = rest;
                    return Some(i);
                }
            }
        }
        None
    }

    fn digits(&mut self, min: usize, max: usize) -> Option<(u32, usize)> {
        let n = self
            .rest
            .iter()
            .take(max)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if n < min {
            return None;
        }
        let value = self.rest[..n]
            .iter()
            .fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
        self.rest = &self.rest[n..];
        Some((value, n))
    }

    fn time(&mut self) -> Option<(u32, u32, u32)> {
        let (hour, _) = self.digits(2, 2)?;
        self.literal(b":")?;
        let (minute, _) = self.digits(2, 2)?;
        self.literal(b":")?;
        let (second, _) = self.digits(2, 2)?;
        Some((hour, minute, second))
    }

    /// 時區：英文字母縮寫一律視為 UTC，`+HHMM`/`-HHMM` 則換算為偏移秒數。
    fn zone(&mut self) -> Option<i64> {
        let zone = std::mem::take(&mut self.rest);
        match zone {
            [sign @ (b'+' | b'-'), digits @ ..] if digits.len() == 4 => {
                let mut scanner = Scanner::new(digits);
                let (hours, _) = scanner.digits(2, 2)?;
                let (minutes, _) = scanner.digits(2, 2)?;
                if hours > 18 || minutes > 59 {
                    return None;
                }
                let secs = i64::from(hours * 3600 + minutes * 60);
                Some(if *sign == b'-' { -secs } else { secs })
            }
            _ if !zone.is_empty() && zone.iter().all(u8::is_ascii_alphabetic) => Some(0),
            _ => None,
        }
    }

    fn finish(&self) -> Option<()> {
        self.rest.is_empty().then_some(())
    }
}

/// `EEE, dd MMM yyyy HH:mm:ss zzz`
fn parse_rfc1123(input: &[u8]) -> Option<i64> {
    let mut s = Scanner::new(input);
    let weekday = s.name(&[&WEEKDAYS_SHORT[..]])?;
    s.literal(b", ")?;
    let (day, _) = s.digits(1, 2)?;
    s.literal(b" ")?;
    let month = s.name(&[&MONTHS_SHORT[..]])?;
    s.literal(b" ")?;
    let (year, _) = s.digits(4, 4)?;
    s.literal(b" ")?;
    let (hour, minute, second) = s.time()?;
    s.literal(b" ")?;
    let offset_secs = s.zone()?;
    s.finish()?;

    DateFields {
        weekday,
        year: year as i32,
        month,
        day,
        hour,
        minute,
        second,
        offset_secs,
    }
    .to_millis()
}

/// `EEEE, dd-MMM-yy[yy] HH:mm:ss zzz`，兩位數年份視為 2000 年代。
fn parse_rfc850(input: &[u8]) -> Option<i64> {
    let mut s = Scanner::new(input);
    let weekday = s.name(&[&WEEKDAYS[..]])?;
    s.literal(b", ")?;
    let (day, _) = s.digits(2, 2)?;
    s.literal(b"-")?;
    let month = s.name(&[&MONTHS_SHORT[..]])?;
    s.literal(b"-")?;
    let year = match s.digits(2, 4)? {
        (yy, 2) => 2000 + yy,
        (yyyy, 4) => yyyy,
        _ => return None,
    };
    s.literal(b" ")?;
    let (hour, minute, second) = s.time()?;
    s.literal(b" ")?;
    let offset_secs = s.zone()?;
    s.finish()?;

    DateFields {
        weekday,
        year: year as i32,
        month,
        day,
        hour,
        minute,
        second,
        offset_secs,
    }
    .to_millis()
}

/// `[EEEE][EEE] [MMMM][MMM] d HH:mm:ss yyyy`，日期前可有補位空白。
fn parse_asctime(input: &[u8]) -> Option<i64> {
    let mut s = Scanner::new(input);
    let weekday = s.name(&[&WEEKDAYS[..], &WEEKDAYS_SHORT[..]])?;
    s.literal(b" ")?;
    let month = s.name(&[&MONTHS[..], &MONTHS_SHORT[..]])?;
    s.spaces()?;
    let (day, _) = s.digits(1, 2)?;
    s.literal(b" ")?;
    let (hour, minute, second) = s.time()?;
    s.literal(b" ")?;
    let (year, _) = s.digits(4, 4)?;
    s.finish()?;

    DateFields {
        weekday,
        year: year as i32,
        month,
        day,
        hour,
        minute,
        second,
        offset_secs: 0,
    }
    .to_millis()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub format_hits: u64,
    pub format_misses: u64,
    pub parse_hits: u64,
    pub parse_misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    format_hits: AtomicU64,
    format_misses: AtomicU64,
    parse_hits: AtomicU64,
    parse_misses: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct CurrentDate {
    generated_ms: i64,
    value: String,
}

/// 跨連線共用的 HTTP 日期快取。
///
/// 以 `Arc<HttpDateCache>` 傳給各個連線處理者，生命週期與伺服器行程相同。
/// 兩個方向的快取各自在大小超過容量時整批清空，而不是逐筆淘汰。
#[derive(Debug)]
pub struct HttpDateCache {
    capacity: usize,
    format_cache: DashMap<i64, String>,
    parse_cache: DashMap<String, i64>,
    current: ArcSwapOption<CurrentDate>,
    counters: Counters,
}

impl Default for HttpDateCache {
    fn default() -> Self {
        Self::new(DateCacheConfig::default())
    }
}

impl HttpDateCache {
    pub fn new(config: DateCacheConfig) -> Self {
        Self {
            capacity: config.capacity,
            format_cache: DashMap::with_capacity(config.capacity),
            parse_cache: DashMap::with_capacity(config.capacity),
            current: ArcSwapOption::empty(),
            counters: Counters::default(),
        }
    }

    pub fn shared(config: DateCacheConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn format(&self, millis: i64) -> Result<String, DateError> {
        if let Some(cached) = self.format_cache.get(&millis) {
            Counters::bump(&self.counters.format_hits);
            return Ok(cached.value().clone());
        }

        Counters::bump(&self.counters.format_misses);
        let formatted = format_millis(millis)?;
        insert_bounded(
            &self.format_cache,
            self.capacity,
            "format",
            millis,
            formatted.clone(),
        );
        Ok(formatted)
    }

    /// 解析 HTTP 日期。無法解析時回傳 `None`，失敗結果不會被快取。
    pub fn parse(&self, value: &str) -> Option<i64> {
        if let Some(cached) = self.parse_cache.get(value) {
            Counters::bump(&self.counters.parse_hits);
            return Some(*cached.value());
        }

        Counters::bump(&self.counters.parse_misses);
        let millis = parse_http_date(value)?;
        insert_bounded(
            &self.parse_cache,
            self.capacity,
            "parse",
            value.to_string(),
            millis,
        );
        Some(millis)
    }

    /// 目前時間的 HTTP 日期字串，給每個回應的 `Date` 標頭使用。
    pub fn now(&self) -> String {
        self.current_date_at(Utc::now())
    }

    /// 與 [`HttpDateCache::now`] 相同，但時間由呼叫端提供。
    ///
    /// 快照距今不超過 [`CURRENT_DATE_TTL_MS`] 時直接重用；否則重新格式化並發布新快照。
    /// 多個執行緒同時更新時以最後寫入者為準。
    pub fn current_date_at(&self, now: DateTime<Utc>) -> String {
        let now_ms = now.timestamp_millis();
        if let Some(current) = &*self.current.load() {
            let elapsed = now_ms.saturating_sub(current.generated_ms);
            if (0..=CURRENT_DATE_TTL_MS).contains(&elapsed) {
                return current.value.clone();
            }
        }

        let value = format_date(&now);
        trace!(date = %value, "Refreshing current HTTP date");
        self.current.store(Some(Arc::new(CurrentDate {
            generated_ms: now_ms,
            value: value.clone(),
        })));
        value
    }

    pub fn format_cache_len(&self) -> usize {
        self.format_cache.len()
    }

    pub fn parse_cache_len(&self) -> usize {
        self.parse_cache.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            format_hits: self.counters.format_hits.load(Ordering::Relaxed),
            format_misses: self.counters.format_misses.load(Ordering::Relaxed),
            parse_hits: self.counters.parse_hits.load(Ordering::Relaxed),
            parse_misses: self.counters.parse_misses.load(Ordering::Relaxed),
        }
    }
}

fn insert_bounded<K, V>(
    cache: &DashMap<K, V>,
    capacity: usize,
    direction: &str,
    key: K,
    value: V,
) where
    K: Eq + Hash,
{
    let size = cache.len();
    if size > capacity {
        debug!(direction, size, capacity, "Clearing HTTP date cache");
        cache.clear();
    }
    cache.insert(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANT_MS: i64 = 1_584_376_103_000;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_format_rfc1123() {
        let cache = HttpDateCache::default();
        assert_eq!(
            cache.format(1_584_370_526_000).unwrap(),
            "Mon, 16 Mar 2020 14:55:26 GMT"
        );
        assert_eq!(cache.format(0).unwrap(), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(
            cache.format(-1).unwrap(),
            "Wed, 31 Dec 1969 23:59:59 GMT"
        );
    }

    #[test]
    fn test_format_stays_gmt_after_parsing_other_zone() {
        let cache = HttpDateCache::default();
        cache.parse("Thu, 12 Mar 2020 14:40:22 CET");
        assert!(cache.format(Utc::now().timestamp_millis()).unwrap().ends_with("GMT"));
    }

    #[test]
    fn test_parse_all_formats() {
        let cache = HttpDateCache::default();
        for value in [
            "Mon, 16 Mar 2020 16:28:23 GMT",
            "Monday, 16-Mar-2020 16:28:23 GMT",
            "Monday, 16-Mar-20 16:28:23 GMT",
            "Mon Mar 16 16:28:23 2020",
            "Mon March 16 16:28:23 2020",
            "Monday March 16 16:28:23 2020",
        ] {
            assert_eq!(cache.parse(value), Some(INSTANT_MS), "{value}");
        }
    }

    #[test]
    fn test_parse_zone_handling() {
        assert_eq!(
            parse_http_date("Mon, 16 Mar 2020 16:28:23 UTC"),
            Some(INSTANT_MS)
        );
        assert_eq!(
            parse_http_date("Mon, 16 Mar 2020 18:28:23 +0200"),
            Some(INSTANT_MS)
        );
        assert_eq!(
            parse_http_date("Mon, 16 Mar 2020 15:28:23 -0100"),
            Some(INSTANT_MS)
        );
        assert_eq!(parse_http_date("Mon, 16 Mar 2020 16:28:23"), None);
        assert_eq!(parse_http_date("Mon, 16 Mar 2020 16:28:23 G1T"), None);
    }

    #[test]
    fn test_parse_asctime_padded_day() {
        assert_eq!(
            parse_http_date("Fri Mar  6 16:28:23 2020"),
            parse_http_date("Fri, 06 Mar 2020 16:28:23 GMT")
        );
        assert!(parse_http_date("Fri Mar  6 16:28:23 2020").is_some());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        for value in [
            "",
            "yesterday",
            "mon, 16 Mar 2020 16:28:23 GMT",
            "Mon, 16 MAR 2020 16:28:23 GMT",
            "Tue, 16 Mar 2020 16:28:23 GMT",
            "Mon, 30 Feb 2020 16:28:23 GMT",
            "Mon, 16 Mar 2020 24:28:23 GMT",
            "Mon, 16 Mar 2020 16:28:23 GMT ",
            " Mon, 16 Mar 2020 16:28:23 GMT",
            "Monday, 16-Mar-020 16:28:23 GMT",
        ] {
            assert_eq!(parse_http_date(value), None, "{value:?}");
        }
    }

    #[test]
    fn test_round_trip() {
        let cache = HttpDateCache::default();
        for millis in [
            0,
            INSTANT_MS,
            -86_400_000,
            -2_208_988_800_000,
            253_402_300_799_000,
            951_782_400_000,
        ] {
            let formatted = cache.format(millis).unwrap();
            assert_eq!(cache.parse(&formatted), Some(millis), "{formatted}");
        }
    }

    #[test]
    fn test_format_truncates_millis() {
        let cache = HttpDateCache::default();
        let formatted = cache.format(INSTANT_MS + 999).unwrap();
        assert_eq!(cache.parse(&formatted), Some(INSTANT_MS));
    }

    #[test]
    fn test_format_out_of_range() {
        let cache = HttpDateCache::default();
        assert_eq!(cache.format(i64::MAX), Err(DateError::OutOfRange(i64::MAX)));
        assert_eq!(cache.format_cache_len(), 0);
    }

    #[test]
    fn test_second_format_is_served_from_cache() {
        let cache = HttpDateCache::default();
        let first = cache.format(INSTANT_MS).unwrap();
        let second = cache.format(INSTANT_MS).unwrap();

        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!(stats.format_misses, 1);
        assert_eq!(stats.format_hits, 1);
    }

    #[test]
    fn test_parse_failures_are_not_cached() {
        let cache = HttpDateCache::default();
        assert_eq!(cache.parse("not a date"), None);
        assert_eq!(cache.parse("not a date"), None);

        assert_eq!(cache.parse_cache_len(), 0);
        assert_eq!(cache.stats().parse_misses, 2);
        assert_eq!(cache.stats().parse_hits, 0);

        cache.parse("Mon, 16 Mar 2020 16:28:23 GMT");
        cache.parse("Mon, 16 Mar 2020 16:28:23 GMT");
        assert_eq!(cache.stats().parse_hits, 1);
    }

    #[test]
    fn test_bulk_clear_on_overflow() {
        let cache = HttpDateCache::new(DateCacheConfig::with_capacity(4));
        for i in 0..5 {
            cache.format(i * 1000).unwrap();
        }
        assert_eq!(cache.format_cache_len(), 5);

        cache.format(5000).unwrap();
        assert_eq!(cache.format_cache_len(), 1);

        let misses = cache.stats().format_misses;
        assert_eq!(
            cache.format(0).unwrap(),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
        assert_eq!(cache.stats().format_misses, misses + 1);
    }

    #[test]
    fn test_parse_cache_bulk_clear() {
        let cache = HttpDateCache::new(DateCacheConfig::with_capacity(2));
        let dates: Vec<String> = (0..4).map(|d| format_millis(d * 86_400_000).unwrap()).collect();
        for date in &dates {
            cache.parse(date);
        }
        assert_eq!(cache.parse_cache_len(), 1);

        let misses = cache.stats().parse_misses;
        assert_eq!(cache.parse(&dates[0]), Some(0));
        assert_eq!(cache.stats().parse_misses, misses + 1);
    }

    #[test]
    fn test_current_date_snapshot() {
        let cache = HttpDateCache::default();

        let first = cache.current_date_at(at(INSTANT_MS));
        assert_eq!(first, "Mon, 16 Mar 2020 16:28:23 GMT");
        assert_eq!(cache.current_date_at(at(INSTANT_MS + 1000)), first);

        let later = cache.current_date_at(at(INSTANT_MS + 1001));
        assert_eq!(later, "Mon, 16 Mar 2020 16:28:24 GMT");
        assert_eq!(cache.current_date_at(at(INSTANT_MS + 1500)), later);

        assert_eq!(
            cache.current_date_at(at(INSTANT_MS - 60_000)),
            "Mon, 16 Mar 2020 16:27:23 GMT"
        );
        assert_eq!(cache.format_cache_len(), 0);
    }

    #[test]
    fn test_now_is_stable_within_a_second() {
        let cache = HttpDateCache::default();
        let first = cache.now();
        let second = cache.now();

        assert_eq!(first, second);
        assert!(first.ends_with(" GMT"));
        assert!(cache.parse(&first).is_some());
    }
}
