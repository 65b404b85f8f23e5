//! Shared value types.

use serde::Deserialize;

/// Per-server deviations from the nominal protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerQuirks {
    /// Send the session token stripped of leading zeros.
    pub session_id: bool,
    /// Server only understands `pids=`, never `addpids=`/`delpids=`.
    pub play_pids: bool,
    /// Server never reports lock; assume it once tuned.
    pub force_lock: bool,
    /// Append `plts=on` to DVB-S2 requests lacking a pilot setting.
    pub force_pilot: bool,
}

impl ServerQuirks {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for ServerQuirks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.session_id {
            names.push("SessionId");
        }
        if self.play_pids {
            names.push("PlayPids");
        }
        if self.force_lock {
            names.push("ForceLock");
        }
        if self.force_pilot {
            names.push("ForcePilot");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Delivery systems a server frontend can tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverySystem {
    DvbS2,
    DvbT,
    DvbT2,
    DvbC,
    DvbC2,
}

impl DeliverySystem {
    /// Delivery system requested by a `msys=` query parameter.
    pub fn from_params(params: &str) -> Option<Self> {
        let msys = params
            .split('&')
            .find_map(|p| p.strip_prefix("msys="))?
            .to_ascii_lowercase();
        match msys.as_str() {
            "dvbs" | "dvbs2" => Some(DeliverySystem::DvbS2),
            "dvbt" => Some(DeliverySystem::DvbT),
            "dvbt2" => Some(DeliverySystem::DvbT2),
            "dvbc" => Some(DeliverySystem::DvbC),
            "dvbc2" => Some(DeliverySystem::DvbC2),
            _ => None,
        }
    }

    /// Model tag used in server descriptions, e.g. `DVBS2-2`.
    pub fn model_tag(&self) -> &'static str {
        match self {
            DeliverySystem::DvbS2 => "DVBS2",
            DeliverySystem::DvbT => "DVBT",
            DeliverySystem::DvbT2 => "DVBT2",
            DeliverySystem::DvbC => "DVBC",
            DeliverySystem::DvbC2 => "DVBC2",
        }
    }
}

/// Parse a model string such as `DVBS2-2,DVBT2-4` into (system, frontend count) pairs.
pub fn parse_model(model: &str) -> Vec<(DeliverySystem, u32)> {
    const SYSTEMS: [DeliverySystem; 5] = [
        DeliverySystem::DvbS2,
        DeliverySystem::DvbT,
        DeliverySystem::DvbT2,
        DeliverySystem::DvbC,
        DeliverySystem::DvbC2,
    ];
    model
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (tag, count) = entry.split_once('-').unwrap_or((entry, "1"));
            let system = SYSTEMS
                .iter()
                .find(|s| s.model_tag().eq_ignore_ascii_case(tag))?;
            Some((*system, count.trim().parse().unwrap_or(1)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_system_from_params() {
        assert_eq!(
            DeliverySystem::from_params("src=1&freq=11494&msys=dvbs2&pol=h"),
            Some(DeliverySystem::DvbS2)
        );
        assert_eq!(
            DeliverySystem::from_params("freq=506&msys=dvbt2"),
            Some(DeliverySystem::DvbT2)
        );
        assert_eq!(DeliverySystem::from_params("freq=506"), None);
    }

    #[test]
    fn test_parse_model() {
        assert_eq!(
            parse_model("DVBS2-2,DVBT2-4,DVBC"),
            vec![
                (DeliverySystem::DvbS2, 2),
                (DeliverySystem::DvbT2, 4),
                (DeliverySystem::DvbC, 1)
            ]
        );
        assert!(parse_model("ATSC-1").is_empty());
    }

    #[test]
    fn test_quirks_display() {
        let quirks = ServerQuirks {
            session_id: true,
            play_pids: true,
            ..Default::default()
        };
        assert_eq!(quirks.to_string(), "SessionId,PlayPids");
        assert_eq!(ServerQuirks::default().to_string(), "none");
        assert!(ServerQuirks::default().is_empty());
    }
}
