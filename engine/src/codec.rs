//! Pure functions over byte lines: build outbound device commands, and
//! classify/parse inbound lines into readings or typed errors. No I/O, no
//! state. See spec.md §4.1.

use crate::error::CodecError;
use crate::reading::{Mode, SensorConfig};

const CR: u8 = 0x0D;
const ESC: u8 = 0x1B;

/// `ESC` — enters the instrument's interactive menu.
pub fn menu_enter() -> Vec<u8> {
    vec![ESC]
}

/// ASCII letter + CR — selects a menu entry.
pub fn menu_command(letter: char) -> Vec<u8> {
    let mut v = vec![letter as u8];
    v.push(CR);
    v
}

/// Decimal digits + CR — replies to a menu prompt with a numeric value.
pub fn numeric_reply(n: i64) -> Vec<u8> {
    let mut v = n.to_string().into_bytes();
    v.push(CR);
    v
}

/// `^` + CR — requests a CONFIG_DUMP line of the device's current settings.
pub fn get_config() -> Vec<u8> {
    let mut v = vec![b'^'];
    v.push(CR);
    v
}

/// `*<tag>Q000!` + CR — primes polled mode for `tag`.
pub fn polled_init(tag: char) -> Vec<u8> {
    let mut v = format!("*{tag}Q000!").into_bytes();
    v.push(CR);
    v
}

/// `><tag>` + CR — requests one polled reading.
pub fn polled_query(tag: char) -> Vec<u8> {
    let mut v = format!(">{tag}").into_bytes();
    v.push(CR);
    v
}

/// `X` + CR — exits the menu, triggering a full device reset (see spec.md
/// §4.4 and §9).
pub fn menu_exit() -> Vec<u8> {
    let mut v = vec![b'X'];
    v.push(CR);
    v
}

/// The known fixed error banners the device emits, and the distinct tag
/// each one carries. See spec.md §4.1.
const ERROR_BANNERS: &[(&str, &str)] = &[
    ("Invalid rate!!! Command is ignored.", "invalid_rate"),
    (
        "****Invalid number, averaging set to 12",
        "invalid_averaging",
    ),
    (" Bad TAG ", "bad_tag"),
    ("I am confused", "confused"),
    ("Timed out waiting for response.", "device_timeout"),
];

const MENU_PROMPT_PHRASE: &str = "select the letter of the menu entry:";

/// A parsed classification of one inbound line (terminator already
/// stripped by the transport).
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    MenuPrompt,
    BannerLine,
    ConfigDump(SensorConfig),
    Echo,
    FreerunReading {
        value: f64,
        temp_c: Option<f64>,
        vin: Option<f64>,
    },
    PolledReading {
        tag: char,
        value: f64,
        temp_c: Option<f64>,
        vin: Option<f64>,
    },
    ErrorBanner { tag: &'static str, text: String },
    Unknown,
}

/// Classify a single line per spec.md §4.1. `expected_tag` is `Some` only
/// while polling in polled mode; a polled reading with a mismatched tag is
/// a hard parse error (`TagMismatch`), not a benign UNKNOWN.
pub fn classify(line: &str, expected_tag: Option<char>) -> Result<Classified, CodecError> {
    let trimmed = line.trim_end();

    if trimmed.trim().to_lowercase() == MENU_PROMPT_PHRASE {
        return Ok(Classified::MenuPrompt);
    }

    for (text, tag) in ERROR_BANNERS {
        if trimmed.contains(text) {
            return Ok(Classified::ErrorBanner {
                tag,
                text: trimmed.to_string(),
            });
        }
    }

    if let Some(cfg) = try_parse_config_dump(trimmed) {
        return Ok(Classified::ConfigDump(cfg));
    }

    if let Some(expected) = expected_tag {
        if let Some(rest) = trimmed.strip_prefix(expected) {
            if let Some(rest) = rest.strip_prefix(',') {
                if let Some(fields) = parse_numeric_fields(rest) {
                    let (value, temp_c, vin) = split_fields(&fields);
                    return Ok(Classified::PolledReading {
                        tag: expected,
                        value,
                        temp_c,
                        vin,
                    });
                }
            }
        }
        // Looks like a tagged polled line, but leading tag doesn't match.
        if let Some(first) = trimmed.chars().next() {
            if first.is_ascii_uppercase() && trimmed.as_bytes().get(1) == Some(&b',') {
                return Err(CodecError::TagMismatch {
                    expected,
                    got: first,
                });
            }
        }
    }

    if let Some(fields) = parse_freerun_line(trimmed) {
        let (value, temp_c, vin) = split_fields(&fields);
        return Ok(Classified::FreerunReading { value, temp_c, vin });
    }

    if looks_like_banner(trimmed) {
        return Ok(Classified::BannerLine);
    }

    Ok(Classified::Unknown)
}

fn split_fields(fields: &[f64]) -> (f64, Option<f64>, Option<f64>) {
    (
        fields[0],
        fields.get(1).copied(),
        fields.get(2).copied(),
    )
}

/// Parse `<optional_preamble><signed_decimal>(,<signed_decimal>){0,2}`.
fn parse_freerun_line(s: &str) -> Option<Vec<f64>> {
    // Strip any non-numeric preamble by finding the first char that could
    // start a signed decimal run of comma-separated numbers.
    for (idx, _) in s.char_indices() {
        let candidate = &s[idx..];
        if let Some(fields) = parse_numeric_fields(candidate) {
            return Some(fields);
        }
    }
    None
}

/// Parse a strict `<signed_decimal>(,<signed_decimal>){0,2}` with no
/// leading preamble; all of `s` must be consumed.
fn parse_numeric_fields(s: &str) -> Option<Vec<f64>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let parts: Vec<&str> = s.split(',').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut out = Vec::with_capacity(parts.len());
    for p in parts {
        let trimmed = p.trim();
        // Rust's f64 parser accepts "nan"/"inf" spellings the device never
        // emits; reject them so such lines fall through to BANNER/UNKNOWN
        // classification instead of being misread as readings.
        if trimmed.chars().any(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let v: f64 = trimmed.parse().ok()?;
        if !v.is_finite() {
            return None;
        }
        out.push(v);
    }
    Some(out)
}

fn looks_like_banner(s: &str) -> bool {
    // Banner/echo lines during firmware startup or undocumented argument
    // echoes: anything with letters that isn't a recognized shape. Treated
    // as UNKNOWN by classify() already if this returns false; this helper
    // only distinguishes "clearly textual" (BANNER_LINE) from genuinely
    // unclassifiable noise (UNKNOWN), per spec.md's policy of never
    // erroring on benign ambiguity.
    s.chars().any(|c| c.is_ascii_alphabetic())
}

/// Parse the `^`-command's single comma-separated CONFIG_DUMP line into a
/// `SensorConfig`. Positional fields, per spec.md §4.1:
/// `sensor_id,firmware_version,averaging,adc_rate_hz,mode,tag,include_temp,
/// include_vin,preamble,calfactor`
fn try_parse_config_dump(line: &str) -> Option<SensorConfig> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != 10 {
        return None;
    }
    let sensor_id = parts[0].trim();
    let firmware_version = parts[1].trim();
    // A config dump always looks like our fixed schema; disambiguate from
    // a 10-field freerun/polled line (which can't happen, those cap at 3
    // fields) by requiring the mode field to be a literal "freerun"/
    // "polled" token.
    let mode = match parts[4].trim() {
        "freerun" => Mode::Freerun,
        "polled" => Mode::Polled,
        _ => return None,
    };
    let averaging: u32 = parts[2].trim().parse().ok()?;
    let adc_rate_hz: u32 = parts[3].trim().parse().ok()?;
    let tag_field = parts[5].trim();
    let tag = if tag_field.is_empty() {
        None
    } else {
        tag_field.chars().next()
    };
    let include_temp: bool = parse_bool_field(parts[6].trim())?;
    let include_vin: bool = parse_bool_field(parts[7].trim())?;
    let preamble = parts[8].trim().to_string();
    let calfactor: f64 = parts[9].trim().parse().ok()?;

    Some(SensorConfig {
        averaging,
        adc_rate_hz,
        mode,
        tag,
        include_temp,
        include_vin,
        sensor_id: sensor_id.to_string(),
        firmware_version: firmware_version.to_string(),
        preamble,
        calfactor,
    })
}

fn parse_bool_field(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "TRUE" | "Y" | "y" => Some(true),
        "0" | "false" | "FALSE" | "N" | "n" => Some(false),
        _ => None,
    }
}

/// Serialize a `SensorConfig` back into the same positional CONFIG_DUMP
/// shape `try_parse_config_dump` reads. Used only by the simulator to
/// script device responses.
pub fn format_config_dump(cfg: &SensorConfig) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        cfg.sensor_id,
        cfg.firmware_version,
        cfg.averaging,
        cfg.adc_rate_hz,
        cfg.mode.as_str(),
        cfg.tag.map(|c| c.to_string()).unwrap_or_default(),
        if cfg.include_temp { 1 } else { 0 },
        if cfg.include_vin { 1 } else { 0 },
        cfg.preamble,
        cfg.calfactor,
    )
}

pub const MENU_PROMPT_LINE: &str = "Select the letter of the menu entry:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_wire_bytes() {
        assert_eq!(menu_enter(), vec![0x1B]);
        assert_eq!(get_config(), b"^\r".to_vec());
        assert_eq!(menu_command('A'), vec![b'A', 0x0D]);
        assert_eq!(numeric_reply(125), b"125\r".to_vec());
        assert_eq!(polled_init('A'), b"*AQ000!\r".to_vec());
        assert_eq!(polled_query('A'), b">A\r".to_vec());
        assert_eq!(menu_exit(), b"X\r".to_vec());
    }

    #[test]
    fn classifies_menu_prompt_case_insensitively_with_whitespace() {
        let line = "  select the letter of the menu entry:   ";
        assert_eq!(classify(line, None).unwrap(), Classified::MenuPrompt);
    }

    #[test]
    fn rejects_partial_menu_prompt() {
        let line = "Select the letter of the menu";
        assert_eq!(classify(line, None).unwrap(), Classified::Unknown);
    }

    #[test]
    fn classifies_freerun_single_value() {
        match classify("1.234", None).unwrap() {
            Classified::FreerunReading { value, temp_c, vin } => {
                assert_eq!(value, 1.234);
                assert_eq!(temp_c, None);
                assert_eq!(vin, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_freerun_with_preamble_and_three_fields() {
        match classify("R1.0,22.5,-5.0", None).unwrap() {
            Classified::FreerunReading { value, temp_c, vin } => {
                assert_eq!(value, 1.0);
                assert_eq!(temp_c, Some(22.5));
                assert_eq!(vin, Some(-5.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_polled_reading_matching_tag() {
        match classify("A,3.21", Some('A')).unwrap() {
            Classified::PolledReading { tag, value, .. } => {
                assert_eq!(tag, 'A');
                assert_eq!(value, 3.21);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tag_mismatch_is_hard_error() {
        let err = classify("B,3.21", Some('A')).unwrap_err();
        assert_eq!(
            err,
            CodecError::TagMismatch {
                expected: 'A',
                got: 'B'
            }
        );
    }

    #[test]
    fn classifies_known_error_banners() {
        match classify("Timed out waiting for response.", None).unwrap() {
            Classified::ErrorBanner { tag, .. } => assert_eq!(tag, "device_timeout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn roundtrips_config_dump() {
        let cfg = SensorConfig {
            averaging: 125,
            adc_rate_hz: 125,
            mode: Mode::Polled,
            tag: Some('A'),
            include_temp: true,
            include_vin: false,
            sensor_id: "Q17".into(),
            firmware_version: "2150 REV 4.003".into(),
            preamble: "std".into(),
            calfactor: 1.0023,
        };
        let line = format_config_dump(&cfg);
        match classify(&line, None).unwrap() {
            Classified::ConfigDump(parsed) => assert_eq!(parsed, cfg),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_numeric_alphabetic_tokens_never_misparse_as_readings() {
        // "nan"/"inf" spellings are rejected as numeric fields and fall
        // through to BANNER_LINE rather than being misread as a reading.
        assert_eq!(classify("nan", None).unwrap(), Classified::BannerLine);
    }
}
