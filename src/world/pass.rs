/// Ordered generation passes. A column's pass is the last one fully applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Pass {
    None = 0,
    Terrain = 1,
    Vegetation = 2,
    NeighbourSunlightFlood = 3,
    Structures = 4,
    Done = 5,
}

/// Number of pass-to-pass transitions (None→Terrain … Structures→Done)
pub const TRANSITION_COUNT: u8 = Pass::Done as u8;

impl Pass {
    pub const ALL: [Pass; 6] = [
        Pass::None,
        Pass::Terrain,
        Pass::Vegetation,
        Pass::NeighbourSunlightFlood,
        Pass::Structures,
        Pass::Done,
    ];

    pub fn from_u8(value: u8) -> Option<Pass> {
        Pass::ALL.get(value as usize).copied()
    }

    pub fn next(self) -> Option<Pass> {
        Pass::from_u8(self as u8 + 1)
    }

    /// Index of the transition that leaves this pass
    pub fn transition(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_order() {
        assert!(Pass::None < Pass::Terrain);
        assert!(Pass::Structures < Pass::Done);
        assert_eq!(Pass::Terrain.next(), Some(Pass::Vegetation));
        assert_eq!(Pass::Done.next(), None);
    }

    #[test]
    fn test_from_u8_round_trips() {
        for pass in Pass::ALL {
            assert_eq!(Pass::from_u8(pass as u8), Some(pass));
        }
        assert_eq!(Pass::from_u8(6), None);
        assert_eq!(TRANSITION_COUNT, 5);
    }
}
