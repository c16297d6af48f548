//! Algorithm tags and the per-algorithm dispatch table.
//!
//! Every behavior that varies by hash family (target divisor, diff-one
//! constant, minimum scan batch, header size and word orientation, merkle
//! hash, hashrate correction) is resolved through [`AlgoSpec`] so the rest
//! of the code never matches on the tag directly.

/// Hash family selected with `--algo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Anime,
    Blake,
    Blakecoin,
    Deep,
    DmdGr,
    Doom,
    Fresh,
    Fugue256,
    Groestl,
    Heavy,
    Keccak,
    Jackpot,
    Luffa,
    Lyra2,
    Mjollnir,
    MyrGr,
    Neoscrypt,
    Nist5,
    Penta,
    Pluck,
    Quark,
    Qubit,
    Scrypt,
    ScryptJane,
    Skein,
    Skein2,
    S3,
    X11,
    X13,
    X14,
    X15,
    X17,
    Zr5,
}

/// How the coinbase/merkle-branch fold is hashed for this family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleHash {
    /// Double SHA-256 (the common case).
    Sha256d,
    /// Single SHA-256.
    Sha256,
    /// The family's own digest, resolved through the kernel registry.
    Kernel,
}

/// Static per-algorithm facts consumed by work assembly and the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct AlgoSpec {
    /// Divisor K applied to the stratum session difficulty before
    /// `diff_to_target` (1, 128, 256 or 65536).
    pub target_divisor: f64,
    /// Numerator of the difficulty ratio for this family.
    pub diffone: u64,
    /// Minimum nonces per scan batch, before the hashrate estimate kicks in.
    pub min_batch: u64,
    /// Bytes of header submitted over getwork (128, 84 or 80).
    pub data_size: usize,
    /// Number of leading header words stored byte-swapped (0, 19 or 20).
    pub be_words: usize,
    /// Word 31 of the padded header.
    pub word31: u32,
    /// Merkle fold hash.
    pub merkle: MerkleHash,
    /// Multiplier applied to measured hashrate to stay comparable with
    /// other miners reporting the same family.
    pub rate_factor: f64,
    /// Network difficulty cannot be derived from nbits for this family.
    /// TODO: scrypt/pluck nbits orientation is still unresolved upstream;
    /// net-diff stays disabled for them until a reference value exists.
    pub net_diff_unavailable: bool,
    /// Header carries the 16-bit reward vote at word 20.
    pub has_vote: bool,
    /// Second-nonce results carry a proof-of-knowledge word at data[22]
    /// that must be copied into data[0] before submit.
    pub has_pok: bool,
    /// Stale detection also compares header words 1..17 against the
    /// current job (solo path only).
    pub stale_prefix_check: bool,
}

const DIFFONE: u64 = 0xFFFF_0000_0000_0000;

const DEFAULT_SPEC: AlgoSpec = AlgoSpec {
    target_divisor: 1.0,
    diffone: DIFFONE,
    min_batch: 0x10_0000,
    data_size: 128,
    be_words: 0,
    word31: 0x280,
    merkle: MerkleHash::Sha256d,
    rate_factor: 1.0,
    net_diff_unavailable: false,
    has_vote: false,
    has_pok: false,
    stale_prefix_check: false,
};

impl Algorithm {
    pub const ALL: [Algorithm; 33] = [
        Algorithm::Anime,
        Algorithm::Blake,
        Algorithm::Blakecoin,
        Algorithm::Deep,
        Algorithm::DmdGr,
        Algorithm::Doom,
        Algorithm::Fresh,
        Algorithm::Fugue256,
        Algorithm::Groestl,
        Algorithm::Heavy,
        Algorithm::Keccak,
        Algorithm::Jackpot,
        Algorithm::Luffa,
        Algorithm::Lyra2,
        Algorithm::Mjollnir,
        Algorithm::MyrGr,
        Algorithm::Neoscrypt,
        Algorithm::Nist5,
        Algorithm::Penta,
        Algorithm::Pluck,
        Algorithm::Quark,
        Algorithm::Qubit,
        Algorithm::Scrypt,
        Algorithm::ScryptJane,
        Algorithm::Skein,
        Algorithm::Skein2,
        Algorithm::S3,
        Algorithm::X11,
        Algorithm::X13,
        Algorithm::X14,
        Algorithm::X15,
        Algorithm::X17,
        Algorithm::Zr5,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anime" => Some(Self::Anime),
            "blake" => Some(Self::Blake),
            "blakecoin" => Some(Self::Blakecoin),
            "deep" => Some(Self::Deep),
            "dmd-gr" | "dmdgr" => Some(Self::DmdGr),
            "doom" => Some(Self::Doom),
            "fresh" => Some(Self::Fresh),
            "fugue256" | "fugue" => Some(Self::Fugue256),
            "groestl" => Some(Self::Groestl),
            "heavy" => Some(Self::Heavy),
            "keccak" => Some(Self::Keccak),
            "jackpot" => Some(Self::Jackpot),
            "luffa" => Some(Self::Luffa),
            "lyra2" => Some(Self::Lyra2),
            "mjollnir" => Some(Self::Mjollnir),
            "myr-gr" | "myrgr" => Some(Self::MyrGr),
            "neoscrypt" => Some(Self::Neoscrypt),
            "nist5" => Some(Self::Nist5),
            "penta" | "pentablake" => Some(Self::Penta),
            "pluck" => Some(Self::Pluck),
            "quark" => Some(Self::Quark),
            "qubit" => Some(Self::Qubit),
            "scrypt" => Some(Self::Scrypt),
            "scrypt-jane" | "scryptjane" => Some(Self::ScryptJane),
            "skein" => Some(Self::Skein),
            "skein2" => Some(Self::Skein2),
            "s3" => Some(Self::S3),
            "x11" => Some(Self::X11),
            "x13" => Some(Self::X13),
            "x14" => Some(Self::X14),
            "x15" => Some(Self::X15),
            "x17" => Some(Self::X17),
            "zr5" => Some(Self::Zr5),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Anime => "anime",
            Self::Blake => "blake",
            Self::Blakecoin => "blakecoin",
            Self::Deep => "deep",
            Self::DmdGr => "dmd-gr",
            Self::Doom => "doom",
            Self::Fresh => "fresh",
            Self::Fugue256 => "fugue256",
            Self::Groestl => "groestl",
            Self::Heavy => "heavy",
            Self::Keccak => "keccak",
            Self::Jackpot => "jackpot",
            Self::Luffa => "luffa",
            Self::Lyra2 => "lyra2",
            Self::Mjollnir => "mjollnir",
            Self::MyrGr => "myr-gr",
            Self::Neoscrypt => "neoscrypt",
            Self::Nist5 => "nist5",
            Self::Penta => "penta",
            Self::Pluck => "pluck",
            Self::Quark => "quark",
            Self::Qubit => "qubit",
            Self::Scrypt => "scrypt",
            Self::ScryptJane => "scrypt-jane",
            Self::Skein => "skein",
            Self::Skein2 => "skein2",
            Self::S3 => "s3",
            Self::X11 => "x11",
            Self::X13 => "x13",
            Self::X14 => "x14",
            Self::X15 => "x15",
            Self::X17 => "x17",
            Self::Zr5 => "zr5",
        }
    }

    pub fn spec(&self) -> AlgoSpec {
        match self {
            Self::Anime | Self::Quark => AlgoSpec {
                diffone: 0xFFFF_FF00_0000_0000,
                rate_factor: if *self == Self::Quark { 0.5 } else { 1.0 },
                ..DEFAULT_SPEC
            },
            Self::Jackpot => AlgoSpec {
                target_divisor: 65536.0,
                min_batch: 0x200_0000,
                rate_factor: 0.5,
                ..DEFAULT_SPEC
            },
            Self::Neoscrypt => AlgoSpec {
                target_divisor: 65536.0,
                data_size: 80,
                net_diff_unavailable: true,
                ..DEFAULT_SPEC
            },
            Self::Pluck => AlgoSpec {
                target_divisor: 65536.0,
                diffone: 0xFFFF_FFFF_0000_0000,
                min_batch: 0x2000,
                net_diff_unavailable: true,
                ..DEFAULT_SPEC
            },
            Self::Scrypt | Self::ScryptJane => AlgoSpec {
                target_divisor: 65536.0,
                diffone: 0xFFFF_FFFF_0000_0000,
                net_diff_unavailable: true,
                ..DEFAULT_SPEC
            },
            Self::DmdGr | Self::Fresh => AlgoSpec {
                target_divisor: 256.0,
                ..DEFAULT_SPEC
            },
            Self::Fugue256 | Self::Groestl => AlgoSpec {
                target_divisor: 256.0,
                merkle: MerkleHash::Sha256,
                ..DEFAULT_SPEC
            },
            Self::Keccak => AlgoSpec {
                target_divisor: 128.0,
                min_batch: 0x4000_0000,
                merkle: MerkleHash::Sha256,
                ..DEFAULT_SPEC
            },
            Self::Lyra2 => AlgoSpec {
                target_divisor: 128.0,
                ..DEFAULT_SPEC
            },
            Self::Blakecoin => AlgoSpec {
                min_batch: 0x8000_0000,
                merkle: MerkleHash::Sha256,
                ..DEFAULT_SPEC
            },
            Self::Blake => AlgoSpec {
                min_batch: 0x8000_0000,
                ..DEFAULT_SPEC
            },
            Self::Doom | Self::Luffa => AlgoSpec {
                min_batch: 0x200_0000,
                ..DEFAULT_SPEC
            },
            Self::S3 | Self::X11 | Self::X13 => AlgoSpec {
                min_batch: 0x40_0000,
                ..DEFAULT_SPEC
            },
            Self::Heavy => AlgoSpec {
                data_size: 84,
                be_words: 20,
                merkle: MerkleHash::Kernel,
                has_vote: true,
                ..DEFAULT_SPEC
            },
            Self::Mjollnir => AlgoSpec {
                data_size: 80,
                be_words: 20,
                word31: 0x2A0,
                merkle: MerkleHash::Kernel,
                ..DEFAULT_SPEC
            },
            Self::Zr5 => AlgoSpec {
                data_size: 80,
                be_words: 19,
                has_pok: true,
                stale_prefix_check: true,
                ..DEFAULT_SPEC
            },
            _ => DEFAULT_SPEC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips() {
        for algo in Algorithm::ALL {
            assert_eq!(Algorithm::from_str(algo.name()), Some(algo));
        }
    }

    #[test]
    fn divisor_families() {
        assert_eq!(Algorithm::Jackpot.spec().target_divisor, 65536.0);
        assert_eq!(Algorithm::Groestl.spec().target_divisor, 256.0);
        assert_eq!(Algorithm::Keccak.spec().target_divisor, 128.0);
        assert_eq!(Algorithm::X11.spec().target_divisor, 1.0);
    }

    #[test]
    fn header_orientation() {
        assert_eq!(Algorithm::Heavy.spec().be_words, 20);
        assert_eq!(Algorithm::Mjollnir.spec().word31, 0x2A0);
        assert_eq!(Algorithm::Zr5.spec().be_words, 19);
        assert_eq!(Algorithm::X11.spec().word31, 0x280);
    }

    #[test]
    fn scan_minimums() {
        assert_eq!(Algorithm::Blakecoin.spec().min_batch, 0x8000_0000);
        assert_eq!(Algorithm::Pluck.spec().min_batch, 0x2000);
        assert_eq!(Algorithm::X17.spec().min_batch, 0x10_0000);
    }
}
