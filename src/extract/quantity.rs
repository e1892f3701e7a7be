//! Quantity extraction with Chinese and English number-word parsing.
//!
//! Quantities are canonicalized to a small unit set (CNY, km, %, °C,
//! kg) so that downstream graph nodes dedupe across phrasings:
//! "三十块", "30元", and "30 yuan" all become `30 CNY`.

use std::sync::OnceLock;

use regex::Regex;

/// A canonicalized quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    /// Numeric value.
    pub value: f64,
    /// Canonical unit (CNY, km, %, °C, kg).
    pub unit: &'static str,
}

struct QuantityPatterns {
    cny: Regex,
    km: Regex,
    percent: Regex,
    celsius: Regex,
    kg: Regex,
}

const EN_WORD: &str = "(?:zero|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|\
thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|twenty|thirty|forty|fifty|\
sixty|seventy|eighty|ninety|hundred|thousand|and)";

/// Regex alternation matching one number token in any supported form.
pub(crate) fn num_pattern() -> String {
    format!(r"[\d.]+|[零〇一二两三四五六七八九十百千万亿]+|{EN_WORD}(?:[\s-]{EN_WORD})*")
}

fn patterns() -> &'static QuantityPatterns {
    static PATTERNS: OnceLock<QuantityPatterns> = OnceLock::new();
    PATTERNS.get_or_init(compile_patterns)
}

#[allow(clippy::unwrap_used)] // pattern literals are compile-time constants
fn compile_patterns() -> QuantityPatterns {
    let num = num_pattern();
    QuantityPatterns {
        cny: Regex::new(&format!(r"({num})\s*(?:元|块钱|块|人民币|CNY|yuan)")).unwrap(),
        km: Regex::new(&format!(r"({num})\s*(?:公里|千米|km|kilometers?)")).unwrap(),
        percent: Regex::new(&format!(r"({num})\s*(?:%|％)|百分之\s*({num})")).unwrap(),
        celsius: Regex::new(&format!(r"({num})\s*(?:°C|℃|度|celsius)")).unwrap(),
        kg: Regex::new(&format!(r"({num})\s*(?:公斤|千克|kg|kilograms?)")).unwrap(),
    }
}

/// Extract all canonical quantities from the text.
pub fn extract(text: &str) -> Vec<Quantity> {
    let p = patterns();
    let mut out = Vec::new();

    for (regex, unit) in [
        (&p.cny, "CNY"),
        (&p.km, "km"),
        (&p.celsius, "°C"),
        (&p.kg, "kg"),
    ] {
        for caps in regex.captures_iter(text) {
            if let Some(value) = caps.get(1).and_then(|m| parse_number_token(m.as_str())) {
                out.push(Quantity { value, unit });
            }
        }
    }

    for caps in p.percent.captures_iter(text) {
        let token = caps.get(1).or_else(|| caps.get(2));
        if let Some(value) = token.and_then(|m| parse_number_token(m.as_str())) {
            out.push(Quantity { value, unit: "%" });
        }
    }

    out
}

/// Parse one number token: digits, Chinese numerals (including 万 and
/// 亿 sections and 点-decimals), or English number words.
pub fn parse_number_token(token: &str) -> Option<f64> {
    let t = token.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(v) = t.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    if let Some(v) = parse_chinese_number(t) {
        return Some(v);
    }
    parse_english_number(t).map(int_to_f64)
}

#[allow(clippy::cast_precision_loss)] // word-number magnitudes fit f64
fn int_to_f64(v: u64) -> f64 {
    v as f64
}

const CN_DIGITS: [(char, u64); 12] = [
    ('零', 0),
    ('〇', 0),
    ('一', 1),
    ('二', 2),
    ('两', 2),
    ('三', 3),
    ('四', 4),
    ('五', 5),
    ('六', 6),
    ('七', 7),
    ('八', 8),
    ('九', 9),
];

fn cn_digit(ch: char) -> Option<u64> {
    CN_DIGITS.iter().find(|(c, _)| *c == ch).map(|(_, v)| *v)
}

fn parse_chinese_number(text: &str) -> Option<f64> {
    if let Some((int_part, frac_part)) = text.split_once(['点', '.']) {
        let int_value = parse_chinese_integer(int_part)?;
        let mut frac = String::new();
        for ch in frac_part.chars() {
            if let Some(d) = cn_digit(ch) {
                frac.push_str(&d.to_string());
            } else if ch.is_ascii_digit() {
                frac.push(ch);
            } else {
                return None;
            }
        }
        let int_value = int_to_f64(int_value);
        if frac.is_empty() {
            return Some(int_value);
        }
        let frac: f64 = format!("0.{frac}").parse().ok()?;
        return Some(int_value + frac);
    }
    parse_chinese_integer(text).map(int_to_f64)
}

fn parse_chinese_integer(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }

    // Pure digit sequences like 一二三 read positionally.
    if text.chars().all(|c| cn_digit(c).is_some()) {
        let mut value: u64 = 0;
        for ch in text.chars() {
            value = value.checked_mul(10)?.checked_add(cn_digit(ch)?)?;
        }
        return Some(value);
    }

    let mut total: u64 = 0;
    let mut section: u64 = 0;
    let mut num: u64 = 0;
    let mut any = false;

    for ch in text.chars() {
        if let Some(d) = cn_digit(ch) {
            num = d;
            any = true;
            continue;
        }
        let small = match ch {
            '十' => Some(10),
            '百' => Some(100),
            '千' => Some(1000),
            _ => None,
        };
        if let Some(unit) = small {
            any = true;
            if num == 0 {
                num = 1;
            }
            section = section.checked_add(num.checked_mul(unit)?)?;
            num = 0;
            continue;
        }
        let large = match ch {
            '万' | '萬' => Some(10_000u64),
            '亿' => Some(100_000_000u64),
            _ => None,
        };
        if let Some(unit) = large {
            any = true;
            section = section.checked_add(num)?;
            num = 0;
            total = total.checked_add(section.checked_mul(unit)?)?;
            section = 0;
            continue;
        }
        return None;
    }

    if !any {
        return None;
    }
    section = section.checked_add(num)?;
    total = total.checked_add(section)?;
    Some(total)
}

const EN_SMALL: [(&str, u64); 20] = [
    ("zero", 0),
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("six", 6),
    ("seven", 7),
    ("eight", 8),
    ("nine", 9),
    ("ten", 10),
    ("eleven", 11),
    ("twelve", 12),
    ("thirteen", 13),
    ("fourteen", 14),
    ("fifteen", 15),
    ("sixteen", 16),
    ("seventeen", 17),
    ("eighteen", 18),
    ("nineteen", 19),
];

const EN_TENS: [(&str, u64); 8] = [
    ("twenty", 20),
    ("thirty", 30),
    ("forty", 40),
    ("fifty", 50),
    ("sixty", 60),
    ("seventy", 70),
    ("eighty", 80),
    ("ninety", 90),
];

fn parse_english_number(text: &str) -> Option<u64> {
    let t = text.to_lowercase();
    let t = t.replace(['-', '_'], " ");
    let words: Vec<&str> = t.split_whitespace().filter(|w| *w != "and").collect();
    if words.is_empty() {
        return None;
    }

    let mut total: u64 = 0;
    let mut current: u64 = 0;
    let mut any = false;

    for w in words {
        if let Some((_, v)) = EN_SMALL.iter().find(|(s, _)| *s == w) {
            current = current.checked_add(*v)?;
            any = true;
            continue;
        }
        if let Some((_, v)) = EN_TENS.iter().find(|(s, _)| *s == w) {
            current = current.checked_add(*v)?;
            any = true;
            continue;
        }
        match w {
            "hundred" => {
                if current == 0 {
                    current = 1;
                }
                current = current.checked_mul(100)?;
                any = true;
            }
            "thousand" => {
                if current == 0 {
                    current = 1;
                }
                total = total.checked_add(current.checked_mul(1000)?)?;
                current = 0;
                any = true;
            }
            _ => return None,
        }
    }

    any.then(|| total.checked_add(current))?
}
