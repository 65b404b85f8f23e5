//! Decoder for the reception parameter string reported by servers.
//!
//! The same string arrives in the RTCP vendor record and in DESCRIBE bodies:
//!
//! ```text
//! ver=1.0;src=1;tuner=<feID>,<level>,<lock>,<quality>,<freq>,...;pids=0,16
//! ```

/// Largest level value a server reports.
pub const MAX_SIGNAL_LEVEL: i32 = 255;

/// Largest quality value a server reports.
pub const MAX_SIGNAL_QUALITY: i32 = 15;

/// Signal state decoded from one parameter string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionStatus {
    pub frontend_id: i32,
    /// 0-100, or -1 when unknown.
    pub signal_strength: i32,
    pub has_lock: bool,
    /// 0-100, or -1 when unknown. Always 0 without lock.
    pub signal_quality: i32,
}

impl Default for ReceptionStatus {
    fn default() -> Self {
        Self {
            frontend_id: -1,
            signal_strength: -1,
            has_lock: false,
            signal_quality: -1,
        }
    }
}

/// Decode the `tuner=` fields of `params`. Returns `None` if there are none.
pub fn parse_reception_params(params: &str) -> Option<ReceptionStatus> {
    let start = params.find(";tuner=")? + ";tuner=".len();
    let mut fields = params[start..].split(',');

    let frontend_id = atoi(fields.next()?);

    let level = atoi(fields.next()?).min(MAX_SIGNAL_LEVEL);
    let signal_strength = if level >= 0 {
        level * 100 / MAX_SIGNAL_LEVEL
    } else {
        -1
    };

    let has_lock = atoi(fields.next()?) != 0;

    let quality = atoi(fields.next()?).min(MAX_SIGNAL_QUALITY);
    let signal_quality = if has_lock && quality >= 0 {
        quality * 100 / MAX_SIGNAL_QUALITY
    } else {
        0
    };

    Some(ReceptionStatus {
        frontend_id,
        signal_strength,
        has_lock,
        signal_quality,
    })
}

/// Leading integer of `s`, 0 if there is none.
fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let value = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i32, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as i32));
    if negative {
        -value
    } else {
        value
    }
}
