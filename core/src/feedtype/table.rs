//! The built-in feedtype table.

use super::{Feedtype, FeedtypeTable};

macro_rules! bit {
    ($t:expr, $name:literal, $bit:literal) => {
        $t.add_bit($name, $bit)
            .expect("builtin feedtype table is consistent")
    };
}

macro_rules! mask {
    ($t:expr, $name:literal, $mask:expr) => {
        $t.add_mask($name, Feedtype($mask), false)
            .expect("builtin feedtype table is consistent")
    };
}

/// Builds the standard feedtype table: the primitive bits of the
/// dissemination universe plus the conventional union masks.
pub fn builtin_table() -> FeedtypeTable {
    let mut t = FeedtypeTable::new();

    bit!(t, "PPS", 0);
    bit!(t, "DDS", 1);
    bit!(t, "IDS", 2);
    bit!(t, "HDS", 3);
    bit!(t, "SPARE", 4);
    bit!(t, "UNIWISC", 5);
    bit!(t, "PCWS", 6);
    bit!(t, "FSL2", 7);
    bit!(t, "FSL3", 8);
    bit!(t, "FSL4", 9);
    bit!(t, "FSL5", 10);
    bit!(t, "GPSSRC", 11);
    bit!(t, "CONDUIT", 12);
    bit!(t, "FNEXRAD", 13);
    bit!(t, "LIGHTNING", 14);
    bit!(t, "WSI", 15);
    bit!(t, "DIFAX", 16);
    bit!(t, "FAA604", 17);
    bit!(t, "GPS", 18);
    bit!(t, "FNMOC", 19);
    bit!(t, "GEM", 20);
    bit!(t, "NIMAGE", 21);
    bit!(t, "NTEXT", 22);
    bit!(t, "NGRID", 23);
    bit!(t, "NPOINT", 24);
    bit!(t, "NGRAPH", 25);
    bit!(t, "NOTHER", 26);
    bit!(t, "NEXRAD3", 27);
    bit!(t, "NEXRD2", 28);
    bit!(t, "NXRDSRC", 29);
    bit!(t, "EXP", 30);
    bit!(t, "LOCAL", 31);

    mask!(t, "DDPLUS", 0x0000_0003); // PPS|DDS
    mask!(t, "WMO", 0x0000_001f); // DDPLUS|IDS|HDS|SPARE
    mask!(t, "NMC", 0x0000_000f); // PPS|DDS|IDS|HDS
    mask!(t, "UNIDATA", 0x0000_003f); // WMO|UNIWISC
    mask!(t, "FSL", 0x0000_07c0); // PCWS|FSL2..FSL5
    mask!(t, "NPORT", 0x07e0_0000); // NIMAGE..NOTHER
    mask!(t, "ANY", 0xffff_ffff);
    mask!(t, "NONE", 0x0000_0000);

    // Conventional aliases for the same bits.
    mask!(t, "HRS", 0x0000_0008);
    mask!(t, "MCIDAS", 0x0000_0020);
    mask!(t, "ACARS", 0x0000_0040);
    mask!(t, "NLDN", 0x0000_4000);
    mask!(t, "CMC", 0x0010_0000);
    mask!(t, "NEXRAD", 0x0800_0000);
    mask!(t, "CRAFT", 0x1000_0000);

    t
}
