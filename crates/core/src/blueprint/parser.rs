//! Parsing of the semi-structured blueprint text and of the narrative
//! parts inside the plot architecture.
//!
//! The blueprint is a sequence of chapter blocks separated by blank lines;
//! each block opens with a `第N章 - 标题` header followed by labelled
//! fields. Blocks without a recognizable header are skipped; numbering
//! problems are surfaced by [`ensure_contiguous`] rather than patched over.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlueprintEntry {
    pub chapter_number: u32,
    pub chapter_title: String,
    pub chapter_role: String,
    pub chapter_purpose: String,
    pub suspense_level: String,
    pub connection_elements: String,
    pub chapter_summary: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContiguityError {
    #[error("blueprint is empty")]
    Empty,
    #[error("blueprint must start at chapter 1, found chapter {0}")]
    WrongStart(u32),
    #[error("blueprint chapter numbers jump from {previous} to {found}")]
    Gap { previous: u32, found: u32 },
    #[error("blueprint contains chapter {0} more than once")]
    Duplicate(u32),
}

pub fn parse_blueprint(text: &str) -> Vec<BlueprintEntry> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for block in block_split_regex().split(trimmed) {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let Some(first) = lines.first() else {
            continue;
        };
        let Some(header) = header_regex().captures(first) else {
            continue;
        };
        let Some(chapter_number) = header
            .get(1)
            .and_then(|m| m.as_str().trim().parse::<u32>().ok())
        else {
            continue;
        };

        let mut entry = BlueprintEntry {
            chapter_number,
            chapter_title: header
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
            chapter_role: String::new(),
            chapter_purpose: String::new(),
            suspense_level: String::new(),
            connection_elements: String::new(),
            chapter_summary: String::new(),
        };

        for line in &lines[1..] {
            if let Some(value) = field_value(role_regex(), line) {
                entry.chapter_role = value;
            } else if let Some(value) = field_value(purpose_regex(), line) {
                entry.chapter_purpose = value;
            } else if let Some(value) = field_value(suspense_regex(), line) {
                entry.suspense_level = value;
            } else if let Some(value) = field_value(connection_regex(), line) {
                entry.connection_elements = value;
            } else if let Some(value) = field_value(summary_regex(), line) {
                entry.chapter_summary = value;
            }
        }

        entries.push(entry);
    }

    entries.sort_by_key(|entry| entry.chapter_number);
    entries
}

/// Resumption scans chapter numbers, so a gapped or duplicated sequence
/// would silently restart generation in the wrong place. Reject it.
pub fn ensure_contiguous(entries: &[BlueprintEntry]) -> Result<(), ContiguityError> {
    let Some(first) = entries.first() else {
        return Err(ContiguityError::Empty);
    };
    if first.chapter_number != 1 {
        return Err(ContiguityError::WrongStart(first.chapter_number));
    }

    for pair in entries.windows(2) {
        let (previous, found) = (pair[0].chapter_number, pair[1].chapter_number);
        if found == previous {
            return Err(ContiguityError::Duplicate(found));
        }
        if found != previous + 1 {
            return Err(ContiguityError::Gap { previous, found });
        }
    }
    Ok(())
}

pub fn find_max_chapter_number(text: &str) -> Option<u32> {
    finder_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().trim().parse::<u32>().ok())
        .max()
}

/// Keeps only the most recent `window` chapters' worth of blueprint text,
/// bounding prompt size regardless of how long the novel has grown.
pub fn limit_to_recent_chapters(text: &str, window: usize) -> String {
    if window == 0 {
        return String::new();
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut boundaries: Vec<usize> = finder_regex().find_iter(trimmed).map(|m| m.start()).collect();
    if boundaries.is_empty() || boundaries.len() <= window {
        return trimmed.to_string();
    }
    boundaries.push(trimmed.len());

    let keep_from = boundaries.len() - 1 - window;
    let segments: Vec<&str> = boundaries[keep_from..]
        .windows(2)
        .map(|pair| trimmed[pair[0]..pair[1]].trim())
        .collect();
    segments.join("\n\n")
}

/// One narrative part of the plot architecture, delimited by a
/// `第X部分：标题` heading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlotPart {
    pub index: usize,
    pub heading: String,
    pub body: String,
}

pub fn parse_plot_parts(text: &str) -> Vec<PlotPart> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let starts: Vec<usize> = part_heading_regex()
        .find_iter(trimmed)
        .map(|m| m.start())
        .collect();
    if starts.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    for (index, window) in starts
        .iter()
        .copied()
        .zip(starts.iter().copied().skip(1).chain([trimmed.len()]))
        .enumerate()
    {
        let (start, end) = window;
        let section = trimmed[start..end].trim();
        let (heading, body) = match section.split_once('\n') {
            Some((heading, body)) => (heading.trim().to_string(), body.trim().to_string()),
            None => (section.to_string(), String::new()),
        };
        parts.push(PlotPart {
            index,
            heading,
            body,
        });
    }
    parts
}

fn field_value(regex: &Regex, line: &str) -> Option<String> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn block_split_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n\s*\n").expect("invalid blueprint block splitter"))
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^第\s*(\d+)\s*章\s*-\s*\[?(.*?)\]?$").expect("invalid chapter header regex")
    })
}

fn role_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^本章定位[：:]\s*\[?(.*?)\]?$").expect("invalid role regex"))
}

fn purpose_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^核心作用[：:]\s*\[?(.*?)\]?$").expect("invalid purpose regex"))
}

fn suspense_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^悬念密度[：:]\s*\[?(.*?)\]?$").expect("invalid suspense regex"))
}

fn connection_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"^衔接要素[：:]\s*\[?(.*?)\]?$").expect("invalid connection regex"))
}

fn summary_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^本章简述[：:]\s*\[?(.*?)\]?$").expect("invalid summary regex"))
}

fn finder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"第\s*(\d+)\s*章").expect("invalid chapter finder regex"))
}

fn part_heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?m)^第\s*[一二三四五六七八九十百\d]+\s*部分?\s*[：:].*$")
            .expect("invalid part heading regex")
    })
}
