use crate::constants::Constants;
use crate::prelude::Constellation;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Carrier signals, one navigation band per constellation plus the
/// secondary bands the slip detectors may exploit when a receiver
/// happens to track them.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Carrier {
    /// L1 (GPS/QZSS/SBAS) same frequency as E1 and B1aB1c
    #[default]
    L1,
    /// L2 (GPS/QZSS): slip detection only
    L2,
    /// L5 (GPS/QZSS/IRNSS)
    L5,
    /// G1 (Glonass FDMA center frequency)
    G1,
    /// G2 (Glonass): slip detection only
    G2,
    /// E1 (Galileo)
    E1,
    /// E5B (Galileo): slip detection only
    E5B,
    /// B1I (BDS)
    B1I,
    /// B2I (BDS): slip detection only
    B2I,
}

impl std::fmt::Display for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::L5 => write!(f, "L5"),
            Self::G1 => write!(f, "G1"),
            Self::G2 => write!(f, "G2"),
            Self::E1 => write!(f, "E1"),
            Self::E5B => write!(f, "E5B"),
            Self::B1I => write!(f, "B1I"),
            Self::B2I => write!(f, "B2I"),
        }
    }
}

impl Carrier {
    pub fn frequency(&self) -> f64 {
        match self {
            Self::L1 | Self::E1 => 1575.42E6_f64,
            Self::L2 => 1227.60E6_f64,
            Self::L5 => 1176.45E6_f64,
            Self::G1 => 1602.00E6_f64,
            Self::G2 => 1246.00E6_f64,
            Self::E5B | Self::B2I => 1207.14E6_f64,
            Self::B1I => 1561.098E6_f64,
        }
    }

    pub fn wavelength(&self) -> f64 {
        Constants::SPEED_OF_LIGHT_M_S / self.frequency()
    }

    /// Single frequency navigation band for this constellation.
    pub fn navigation_band(c: Constellation) -> Self {
        match c {
            Constellation::Glonass => Self::G1,
            Constellation::Galileo => Self::E1,
            Constellation::BeiDou => Self::B1I,
            Constellation::IRNSS => Self::L5,
            _ => Self::L1,
        }
    }

    /// Secondary band usable by the geometry-free and MW slip
    /// detectors, when the receiver tracks it.
    pub(crate) fn secondary_band(c: Constellation) -> Option<Self> {
        match c {
            Constellation::GPS | Constellation::QZSS => Some(Self::L2),
            Constellation::Glonass => Some(Self::G2),
            Constellation::Galileo => Some(Self::E5B),
            Constellation::BeiDou => Some(Self::B2I),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Carrier;
    use crate::prelude::Constellation;
    use rstest::rstest;

    #[test]
    fn l1_wavelength() {
        let lambda = Carrier::L1.wavelength();
        assert!((lambda - 0.1902936).abs() < 1.0E-6);
    }

    #[rstest]
    #[case(Constellation::GPS, Carrier::L1)]
    #[case(Constellation::QZSS, Carrier::L1)]
    #[case(Constellation::Glonass, Carrier::G1)]
    #[case(Constellation::Galileo, Carrier::E1)]
    #[case(Constellation::BeiDou, Carrier::B1I)]
    #[case(Constellation::IRNSS, Carrier::L5)]
    fn navigation_bands(#[case] constellation: Constellation, #[case] expected: Carrier) {
        assert_eq!(Carrier::navigation_band(constellation), expected);
    }
}
