//! Parsers for FTP listing and reply formats.
//!
//! Covers machine listings (MLSD/MLST facts, RFC 3659), Unix `ls -l` style
//! LIST output and the addresses embedded in EPSV/PASV replies.

use std::net::Ipv4Addr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::fs::types::FileEntry;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Parse one MLSD line (or the fact line of an MLST reply).
///
/// Returns `None` for the `.` and `..` pseudo entries and for lines without
/// a name.
pub fn parse_mlsx_line(line: &str) -> Option<FileEntry> {
    let line = line.trim_start();
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }

    let mut is_dir = false;
    let mut size = 0;
    let mut modified = None;

    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => match value.to_ascii_lowercase().as_str() {
                "dir" => is_dir = true,
                "cdir" | "pdir" => return None,
                _ => is_dir = false,
            },
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_timeval(value),
            _ => {}
        }
    }

    // MLST reports the full path; keep only the final component
    let name = name.trim_end_matches('/');
    let name = name.rsplit('/').next().unwrap_or(name);

    Some(FileEntry {
        name: name.to_string(),
        size: if is_dir { 0 } else { size },
        is_dir,
        modified,
    })
}

/// Parse a `YYYYMMDDHHMMSS[.sss]` time value as used by MLSx and MDTM.
pub fn parse_timeval(value: &str) -> Option<DateTime<Utc>> {
    let whole = value.split('.').next()?;
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse one line of Unix style LIST output.
///
/// `now` decides the year of recent entries, which `ls` prints without one.
pub fn parse_list_line(line: &str, now: DateTime<Utc>) -> Option<FileEntry> {
    let (fields, name) = split_fields(line, 8)?;
    let perms = fields[0];
    let kind = perms.chars().next()?;
    if !matches!(kind, '-' | 'd' | 'l') {
        return None;
    }

    let name = if kind == 'l' {
        name.split(" -> ").next().unwrap_or(name)
    } else {
        name
    };
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let size = fields[4].parse().unwrap_or(0);
    let modified = parse_list_date(fields[5], fields[6], fields[7], now);
    let is_dir = kind == 'd';

    Some(FileEntry {
        name: name.to_string(),
        size: if is_dir { 0 } else { size },
        is_dir,
        modified,
    })
}

fn parse_list_date(
    month: &str,
    day: &str,
    time_or_year: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let month = month.to_ascii_lowercase();
    let month = MONTHS.iter().position(|m| *m == month)? as u32 + 1;
    let day: u32 = day.parse().ok()?;

    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        let date = NaiveDate::from_ymd_opt(now.year(), month, day)?;
        let stamp = date.and_time(time).and_utc();
        // Entries without a year are within the last six months
        if stamp > now + Duration::days(1) {
            let date = NaiveDate::from_ymd_opt(now.year() - 1, month, day)?;
            return Some(date.and_time(time).and_utc());
        }
        Some(stamp)
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        Some(date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?).and_utc())
    }
}

/// Take `count` whitespace separated fields and return them with the rest
/// of the line, whose inner spacing is preserved.
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    while fields.len() < count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest.trim_end_matches(['\r', '\n'])))
}

/// Port from an EPSV reply such as `229 Entering Extended Passive Mode (|||6446|)`.
pub fn parse_epsv(message: &str) -> Option<u16> {
    let start = message.find('(')?;
    let end = message[start..].find(')')? + start;
    let inner = &message[start + 1..end];
    let delimiter = inner.chars().next()?;
    inner
        .split(delimiter)
        .filter(|part| !part.is_empty())
        .last()?
        .parse()
        .ok()
}

/// Address from a PASV reply such as `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_pasv(message: &str) -> Option<(Ipv4Addr, u16)> {
    let digits = message
        .split(|c: char| !c.is_ascii_digit() && c != ',')
        .find(|part| part.matches(',').count() == 5)?;
    let numbers: Vec<u8> = digits
        .split(',')
        .map(|n| n.parse())
        .collect::<Result<_, _>>()
        .ok()?;
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = u16::from(numbers[4]) << 8 | u16::from(numbers[5]);
    Some((ip, port))
}
