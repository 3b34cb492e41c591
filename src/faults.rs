//! Decoding of the inverter's fault message bitfields.

use std::borrow::Cow;

/// The three fault-bearing status words, each with its own bit assignment.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FaultGroup {
    Display,
    #[strum(serialize = "master_1")]
    #[serde(rename = "master_1")]
    Master1,
    #[strum(serialize = "master_2")]
    #[serde(rename = "master_2")]
    Master2,
}

pub type FaultTable = &'static [(u8, &'static str)];

static DISPLAY: FaultTable = &[
    (0, "display board lost communication with the master"),
    (1, "display board EEPROM failure"),
    (2, "real time clock failure"),
    (3, "battery management system communication lost"),
    (4, "energy meter communication lost"),
    (5, "display board firmware mismatch"),
    (8, "Wi-Fi module communication lost"),
    (9, "CT direction reversed"),
];

static MASTER_1: FaultTable = &[
    (0, "grid relay failure"),
    (1, "EEPROM read/write failure"),
    (2, "DC injection current too high"),
    (3, "output current sensor failure"),
    (4, "ground fault (GFCI) detected"),
    (5, "insulation resistance too low"),
    (6, "sink temperature too high"),
    (7, "ambient temperature too high"),
    (8, "grid voltage too high"),
    (9, "grid voltage too low"),
    (10, "grid frequency too high"),
    (11, "grid frequency too low"),
    (12, "grid lost"),
    (13, "10 minute average grid voltage too high"),
    (14, "PV1 voltage too high"),
    (15, "PV2 voltage too high"),
    (16, "DC bus voltage too high"),
    (17, "DC bus voltage too low"),
    (18, "inverter overcurrent"),
    (19, "PV overcurrent"),
    (20, "battery overcurrent"),
    (21, "output overload"),
    (22, "master and slave processor disagreement"),
    (23, "fan failure"),
];

static MASTER_2: FaultTable = &[
    (0, "battery voltage too high"),
    (1, "battery voltage too low"),
    (2, "battery temperature too high"),
    (3, "battery temperature too low"),
    (4, "battery reverse connection"),
    (5, "battery charge current too high"),
    (6, "battery discharge current too high"),
    (7, "battery management system alarm"),
    (8, "off-grid output voltage too high"),
    (9, "off-grid output voltage too low"),
    (10, "off-grid output overload"),
    (11, "off-grid output short circuit"),
    (12, "DC-DC converter overcurrent"),
    (13, "DC-DC converter hardware failure"),
    (16, "arc fault detected"),
    (17, "PV string reversed"),
];

impl FaultGroup {
    pub fn table(self) -> FaultTable {
        match self {
            FaultGroup::Display => DISPLAY,
            FaultGroup::Master1 => MASTER_1,
            FaultGroup::Master2 => MASTER_2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Fault {
    pub bit: u8,
    pub description: Cow<'static, str>,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bit {}: {}", self.bit, self.description)
    }
}

/// List the faults flagged by `bitfield`, lowest bit first.
pub fn decode_faults(bitfield: u32, table: FaultTable) -> Vec<Fault> {
    (0..u32::BITS as u8)
        .filter(|bit| bitfield >> bit & 1 == 1)
        .map(|bit| {
            let description = match table.iter().find(|(b, _)| *b == bit) {
                Some((_, text)) => Cow::Borrowed(*text),
                None => Cow::Owned(format!("unknown error at bit {bit}")),
            };
            Fault { bit, description }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_has_no_faults() {
        for group in [FaultGroup::Display, FaultGroup::Master1, FaultGroup::Master2] {
            assert!(decode_faults(0, group.table()).is_empty());
        }
    }

    #[test]
    fn one_fault_per_set_bit() {
        for bitfield in [1, 0x8000_0001, 0x00F0_0F0F, u32::MAX] {
            let faults = decode_faults(bitfield, FaultGroup::Master1.table());
            assert_eq!(faults.len(), bitfield.count_ones() as usize);
            assert!(faults.windows(2).all(|w| w[0].bit < w[1].bit));
        }
    }

    #[test]
    fn unmapped_bits() {
        let faults = decode_faults(1 << 31 | 1 << 12, FaultGroup::Master1.table());
        assert_eq!(faults[0], Fault { bit: 12, description: "grid lost".into() });
        assert_eq!(faults[1].description, "unknown error at bit 31");
    }

    #[test]
    fn group_names() {
        assert_eq!(FaultGroup::Master2.to_string(), "master_2");
        assert_eq!("display".parse::<FaultGroup>().unwrap(), FaultGroup::Display);
    }
}
