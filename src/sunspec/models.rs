use crate::codec::FieldSpec;
use crate::descriptor::ModelDescriptor;
use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// "SunS" in two registers.
pub const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6e53];
pub const END_MARKER: u16 = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ModelId {
    Common = 1,
    InverterSinglePhase = 101,
    InverterSplitPhase = 102,
    InverterThreePhase = 103,
    InverterSinglePhaseFloat = 111,
    InverterSplitPhaseFloat = 112,
    InverterThreePhaseFloat = 113,
    Storage = 124,
    MeterSinglePhase = 201,
    MeterSplitPhase = 202,
    MeterWyeThreePhase = 203,
    MeterDeltaThreePhase = 204,
    MeterSinglePhaseFloat = 211,
    MeterSplitPhaseFloat = 212,
    MeterWyeThreePhaseFloat = 213,
    MeterDeltaThreePhaseFloat = 214,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phases {
    Single,
    Split,
    Three,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    Common,
    Inverter(Phases),
    Meter(Phases),
    Storage,
}

impl ModelId {
    pub fn kind(self) -> ModelKind {
        use ModelId::*;
        match self {
            Common => ModelKind::Common,
            InverterSinglePhase | InverterSinglePhaseFloat => ModelKind::Inverter(Phases::Single),
            InverterSplitPhase | InverterSplitPhaseFloat => ModelKind::Inverter(Phases::Split),
            InverterThreePhase | InverterThreePhaseFloat => ModelKind::Inverter(Phases::Three),
            MeterSinglePhase | MeterSinglePhaseFloat => ModelKind::Meter(Phases::Single),
            MeterSplitPhase | MeterSplitPhaseFloat => ModelKind::Meter(Phases::Split),
            MeterWyeThreePhase | MeterDeltaThreePhase | MeterWyeThreePhaseFloat
            | MeterDeltaThreePhaseFloat => ModelKind::Meter(Phases::Three),
            Storage => ModelKind::Storage,
        }
    }

    /// Float models carry IEEE-754 values instead of integer + scale factor pairs.
    pub fn is_float(self) -> bool {
        matches!(u16::from(self), 111..=113 | 211..=214)
    }
}

// Field offsets are relative to the first word after the two header words.

const COMMON: &[FieldSpec] = &[
    FieldSpec::ascii("Mn", 0, 16),
    FieldSpec::ascii("Md", 16, 16),
    FieldSpec::ascii("Opt", 32, 8),
    FieldSpec::ascii("Vr", 40, 8),
    FieldSpec::ascii("SN", 48, 16),
    FieldSpec::uint("DA", 64, 1, None),
];

const INVERTER: &[FieldSpec] = &[
    FieldSpec::uint("A", 0, 1, Some("A_SF")),
    FieldSpec::uint("AphA", 1, 1, Some("A_SF")),
    FieldSpec::uint("AphB", 2, 1, Some("A_SF")),
    FieldSpec::uint("AphC", 3, 1, Some("A_SF")),
    FieldSpec::sf("A_SF", 4),
    FieldSpec::uint("PPVphAB", 5, 1, Some("V_SF")),
    FieldSpec::uint("PPVphBC", 6, 1, Some("V_SF")),
    FieldSpec::uint("PPVphCA", 7, 1, Some("V_SF")),
    FieldSpec::uint("PhVphA", 8, 1, Some("V_SF")),
    FieldSpec::uint("PhVphB", 9, 1, Some("V_SF")),
    FieldSpec::uint("PhVphC", 10, 1, Some("V_SF")),
    FieldSpec::sf("V_SF", 11),
    FieldSpec::int("W", 12, 1, Some("W_SF")),
    FieldSpec::sf("W_SF", 13),
    FieldSpec::uint("Hz", 14, 1, Some("Hz_SF")),
    FieldSpec::sf("Hz_SF", 15),
    FieldSpec::int("VA", 16, 1, Some("VA_SF")),
    FieldSpec::sf("VA_SF", 17),
    FieldSpec::int("VAr", 18, 1, Some("VAr_SF")),
    FieldSpec::sf("VAr_SF", 19),
    FieldSpec::int("PF", 20, 1, Some("PF_SF")),
    FieldSpec::sf("PF_SF", 21),
    FieldSpec::uint("WH", 22, 2, Some("WH_SF")),
    FieldSpec::sf("WH_SF", 24),
    FieldSpec::uint("DCA", 25, 1, Some("DCA_SF")),
    FieldSpec::sf("DCA_SF", 26),
    FieldSpec::uint("DCV", 27, 1, Some("DCV_SF")),
    FieldSpec::sf("DCV_SF", 28),
    FieldSpec::int("DCW", 29, 1, Some("DCW_SF")),
    FieldSpec::sf("DCW_SF", 30),
    FieldSpec::int("TmpCab", 31, 1, Some("Tmp_SF")),
    FieldSpec::int("TmpSnk", 32, 1, Some("Tmp_SF")),
    FieldSpec::int("TmpTrns", 33, 1, Some("Tmp_SF")),
    FieldSpec::int("TmpOt", 34, 1, Some("Tmp_SF")),
    FieldSpec::sf("Tmp_SF", 35),
    FieldSpec::enum16("St", 36),
    FieldSpec::enum16("StVnd", 37),
    FieldSpec::bits32("Evt1", 38),
    FieldSpec::bits32("Evt2", 40),
    FieldSpec::bits32("EvtVnd1", 42),
    FieldSpec::bits32("EvtVnd2", 44),
    FieldSpec::bits32("EvtVnd3", 46),
    FieldSpec::bits32("EvtVnd4", 48),
];

const INVERTER_FLOAT: &[FieldSpec] = &[
    FieldSpec::float("A", 0),
    FieldSpec::float("AphA", 2),
    FieldSpec::float("AphB", 4),
    FieldSpec::float("AphC", 6),
    FieldSpec::float("PPVphAB", 8),
    FieldSpec::float("PPVphBC", 10),
    FieldSpec::float("PPVphCA", 12),
    FieldSpec::float("PhVphA", 14),
    FieldSpec::float("PhVphB", 16),
    FieldSpec::float("PhVphC", 18),
    FieldSpec::float("W", 20),
    FieldSpec::float("Hz", 22),
    FieldSpec::float("VA", 24),
    FieldSpec::float("VAr", 26),
    FieldSpec::float("PF", 28),
    FieldSpec::float("WH", 30),
    FieldSpec::float("DCA", 32),
    FieldSpec::float("DCV", 34),
    FieldSpec::float("DCW", 36),
    FieldSpec::float("TmpCab", 38),
    FieldSpec::float("TmpSnk", 40),
    FieldSpec::float("TmpTrns", 42),
    FieldSpec::float("TmpOt", 44),
    FieldSpec::enum16("St", 46),
    FieldSpec::enum16("StVnd", 47),
    FieldSpec::bits32("Evt1", 48),
    FieldSpec::bits32("Evt2", 50),
    FieldSpec::bits32("EvtVnd1", 52),
    FieldSpec::bits32("EvtVnd2", 54),
    FieldSpec::bits32("EvtVnd3", 56),
    FieldSpec::bits32("EvtVnd4", 58),
];

const METER: &[FieldSpec] = &[
    FieldSpec::int("A", 0, 1, Some("A_SF")),
    FieldSpec::int("AphA", 1, 1, Some("A_SF")),
    FieldSpec::int("AphB", 2, 1, Some("A_SF")),
    FieldSpec::int("AphC", 3, 1, Some("A_SF")),
    FieldSpec::sf("A_SF", 4),
    FieldSpec::int("PhV", 5, 1, Some("V_SF")),
    FieldSpec::int("PhVphA", 6, 1, Some("V_SF")),
    FieldSpec::int("PhVphB", 7, 1, Some("V_SF")),
    FieldSpec::int("PhVphC", 8, 1, Some("V_SF")),
    FieldSpec::int("PPV", 9, 1, Some("V_SF")),
    FieldSpec::int("PPVphAB", 10, 1, Some("V_SF")),
    FieldSpec::int("PPVphBC", 11, 1, Some("V_SF")),
    FieldSpec::int("PPVphCA", 12, 1, Some("V_SF")),
    FieldSpec::sf("V_SF", 13),
    FieldSpec::int("Hz", 14, 1, Some("Hz_SF")),
    FieldSpec::sf("Hz_SF", 15),
    FieldSpec::int("W", 16, 1, Some("W_SF")),
    FieldSpec::int("WphA", 17, 1, Some("W_SF")),
    FieldSpec::int("WphB", 18, 1, Some("W_SF")),
    FieldSpec::int("WphC", 19, 1, Some("W_SF")),
    FieldSpec::sf("W_SF", 20),
    FieldSpec::int("VA", 21, 1, Some("VA_SF")),
    FieldSpec::sf("VA_SF", 25),
    FieldSpec::int("VAR", 26, 1, Some("VAR_SF")),
    FieldSpec::sf("VAR_SF", 30),
    FieldSpec::int("PF", 31, 1, Some("PF_SF")),
    FieldSpec::sf("PF_SF", 35),
    FieldSpec::uint("TotWhExp", 36, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhExpPhA", 38, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhExpPhB", 40, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhExpPhC", 42, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhImp", 44, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhImpPhA", 46, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhImpPhB", 48, 2, Some("TotWh_SF")),
    FieldSpec::uint("TotWhImpPhC", 50, 2, Some("TotWh_SF")),
    FieldSpec::sf("TotWh_SF", 52),
    FieldSpec::bits32("Evt", 103),
];

const METER_FLOAT: &[FieldSpec] = &[
    FieldSpec::float("A", 0),
    FieldSpec::float("AphA", 2),
    FieldSpec::float("AphB", 4),
    FieldSpec::float("AphC", 6),
    FieldSpec::float("PhV", 8),
    FieldSpec::float("PhVphA", 10),
    FieldSpec::float("PhVphB", 12),
    FieldSpec::float("PhVphC", 14),
    FieldSpec::float("PPV", 16),
    FieldSpec::float("PPVphAB", 18),
    FieldSpec::float("PPVphBC", 20),
    FieldSpec::float("PPVphCA", 22),
    FieldSpec::float("Hz", 24),
    FieldSpec::float("W", 26),
    FieldSpec::float("WphA", 28),
    FieldSpec::float("WphB", 30),
    FieldSpec::float("WphC", 32),
    FieldSpec::float("VA", 34),
    FieldSpec::float("VAR", 42),
    FieldSpec::float("PF", 50),
    FieldSpec::float("TotWhExp", 58),
    FieldSpec::float("TotWhExpPhA", 60),
    FieldSpec::float("TotWhExpPhB", 62),
    FieldSpec::float("TotWhExpPhC", 64),
    FieldSpec::float("TotWhImp", 66),
    FieldSpec::float("TotWhImpPhA", 68),
    FieldSpec::float("TotWhImpPhB", 70),
    FieldSpec::float("TotWhImpPhC", 72),
    FieldSpec::bits32("Evt", 122),
];

const STORAGE: &[FieldSpec] = &[
    FieldSpec::uint("WChaMax", 0, 1, Some("WChaMax_SF")),
    FieldSpec::uint("WChaGra", 1, 1, Some("WChaDisChaGra_SF")),
    FieldSpec::uint("WDisChaGra", 2, 1, Some("WChaDisChaGra_SF")),
    FieldSpec::bits16("StorCtl_Mod", 3),
    FieldSpec::uint("VAChaMax", 4, 1, Some("VAChaMax_SF")),
    FieldSpec::uint("MinRsvPct", 5, 1, Some("MinRsvPct_SF")),
    FieldSpec::uint("ChaState", 6, 1, Some("ChaState_SF")),
    FieldSpec::uint("StorAval", 7, 1, Some("StorAval_SF")),
    FieldSpec::uint("InBatV", 8, 1, Some("InBatV_SF")),
    FieldSpec::enum16("ChaSt", 9),
    FieldSpec::int("OutWRte", 10, 1, Some("InOutWRte_SF")),
    FieldSpec::int("InWRte", 11, 1, Some("InOutWRte_SF")),
    FieldSpec::uint("InOutWRte_WinTms", 12, 1, None),
    FieldSpec::uint("InOutWRte_RvrtTms", 13, 1, None),
    FieldSpec::uint("InOutWRte_RmpTms", 14, 1, None),
    FieldSpec::enum16("ChaGriSet", 15),
    FieldSpec::sf("WChaMax_SF", 16),
    FieldSpec::sf("WChaDisChaGra_SF", 17),
    FieldSpec::sf("VAChaMax_SF", 18),
    FieldSpec::sf("MinRsvPct_SF", 19),
    FieldSpec::sf("ChaState_SF", 20),
    FieldSpec::sf("StorAval_SF", 21),
    FieldSpec::sf("InBatV_SF", 22),
    FieldSpec::sf("InOutWRte_SF", 23),
];

macro_rules! model {
    ($id:expr, $name:expr, $length:expr, $fields:expr) => {
        ModelDescriptor {
            id: $id as u16,
            name: $name,
            length: Some($length),
            fields: $fields,
        }
    };
}

static DESCRIPTORS: &[ModelDescriptor] = &[
    model!(ModelId::Common, "common", 66, COMMON),
    model!(ModelId::InverterSinglePhase, "inverter single phase", 50, INVERTER),
    model!(ModelId::InverterSplitPhase, "inverter split phase", 50, INVERTER),
    model!(ModelId::InverterThreePhase, "inverter three phase", 50, INVERTER),
    model!(ModelId::InverterSinglePhaseFloat, "inverter single phase (float)", 60, INVERTER_FLOAT),
    model!(ModelId::InverterSplitPhaseFloat, "inverter split phase (float)", 60, INVERTER_FLOAT),
    model!(ModelId::InverterThreePhaseFloat, "inverter three phase (float)", 60, INVERTER_FLOAT),
    model!(ModelId::Storage, "basic storage controls", 24, STORAGE),
    model!(ModelId::MeterSinglePhase, "meter single phase", 105, METER),
    model!(ModelId::MeterSplitPhase, "meter split phase", 105, METER),
    model!(ModelId::MeterWyeThreePhase, "meter wye three phase", 105, METER),
    model!(ModelId::MeterDeltaThreePhase, "meter delta three phase", 105, METER),
    model!(ModelId::MeterSinglePhaseFloat, "meter single phase (float)", 124, METER_FLOAT),
    model!(ModelId::MeterSplitPhaseFloat, "meter split phase (float)", 124, METER_FLOAT),
    model!(ModelId::MeterWyeThreePhaseFloat, "meter wye three phase (float)", 124, METER_FLOAT),
    model!(ModelId::MeterDeltaThreePhaseFloat, "meter delta three phase (float)", 124, METER_FLOAT),
];

pub fn lookup(id: u16) -> Result<&'static ModelDescriptor, CodecError> {
    DESCRIPTORS
        .iter()
        .find(|d| d.id == id)
        .ok_or(CodecError::NotFound(id))
}

pub fn descriptors() -> &'static [ModelDescriptor] {
    DESCRIPTORS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_consistent() {
        for descriptor in descriptors() {
            descriptor.check_layout().unwrap();
            assert!(ModelId::try_from(descriptor.id).is_ok(), "{}", descriptor.name);
        }
    }

    #[test]
    fn unknown_model_is_not_found() {
        assert_eq!(lookup(64110).unwrap_err(), CodecError::NotFound(64110));
        assert_eq!(lookup(103).unwrap().word_length(), 50);
    }

    #[test]
    fn kinds() {
        assert_eq!(ModelId::InverterThreePhaseFloat.kind(), ModelKind::Inverter(Phases::Three));
        assert_eq!(ModelId::MeterDeltaThreePhase.kind(), ModelKind::Meter(Phases::Three));
        assert!(ModelId::MeterSplitPhaseFloat.is_float());
        assert!(!ModelId::Storage.is_float());
    }
}
