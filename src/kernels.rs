//! The seam between the coordination core and the hash kernels.
//!
//! Kernels are opaque: they receive a header, a target and a nonce bound,
//! and report how far they scanned and whether a winning nonce was left in
//! the header. GPU backends register here; the binary ships one CPU
//! reference kernel (Keccak-256) so the core can be exercised end to end.
//! Every other family reports "kernel not built in" at startup, the same
//! way unsupported algorithms surface in other builds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sha3::{Digest, Keccak256};

use crate::algo::Algorithm;
use crate::work::{fulltest, Work};

/// Result of one scan batch. `found` mirrors the kernel return convention:
/// 0 = range exhausted, 1 = nonce in `data[19]`, 2 = a second nonce in
/// `data[21]` as well (pok families also fill `data[22]`).
#[derive(Debug, Clone, Copy)]
pub struct ScanOutput {
    pub found: u8,
    pub hashes_done: u64,
}

pub trait ScanKernel: Send + Sync {
    /// Scan nonces from `work.data[19]` up to and including `max_nonce`.
    /// `stop` is the worker's restart flag; kernels poll it between
    /// blocks of work and may return early with a partial count.
    fn scan(&self, worker: usize, work: &mut Work, max_nonce: u32, stop: &AtomicBool)
        -> Result<ScanOutput>;
}

/// Resolve the kernel for an algorithm, if this binary carries one.
pub fn kernel_for(algo: Algorithm) -> Option<Arc<dyn ScanKernel>> {
    match algo {
        Algorithm::Keccak => Some(Arc::new(KeccakKernel)),
        _ => None,
    }
}

pub fn require_kernel(algo: Algorithm) -> Result<Arc<dyn ScanKernel>> {
    kernel_for(algo)
        .ok_or_else(|| anyhow!("no {} kernel built into this binary", algo.name()))
}

/// Family digest for merkle folding where the wire format demands the
/// algorithm's own hash instead of SHA-256. None of the shipped kernels
/// export one; GPU backends that do register it here.
pub fn merkle_digest(algo: Algorithm, _data: &[u8]) -> Option<[u8; 32]> {
    // The heavy family folds with its own digest; no CPU reference ships
    // in this build.
    let _ = algo;
    None
}

/// Per-worker GPU temperature; telemetry backends are external, so the
/// reference build reports none and the temperature gate stays open.
pub fn gpu_temp(_worker: usize) -> Option<f64> {
    None
}

/// CPU reference kernel: Keccak-256 over the 80-byte header.
struct KeccakKernel;

impl KeccakKernel {
    fn header_bytes(work: &Work) -> [u8; 80] {
        let mut bytes = [0u8; 80];
        for i in 0..20 {
            bytes[4 * i..4 * i + 4].copy_from_slice(&work.data[i].to_le_bytes());
        }
        bytes
    }
}

impl ScanKernel for KeccakKernel {
    fn scan(
        &self,
        _worker: usize,
        work: &mut Work,
        max_nonce: u32,
        stop: &AtomicBool,
    ) -> Result<ScanOutput> {
        let mut header = Self::header_bytes(work);
        let start = work.data[19];
        let mut nonce = start;
        let mut hashes: u64 = 0;

        loop {
            header[76..80].copy_from_slice(&nonce.to_le_bytes());
            let digest = Keccak256::digest(&header);
            hashes += 1;

            let mut hash = [0u32; 8];
            for i in 0..8 {
                hash[i] = u32::from_le_bytes(digest[4 * i..4 * i + 4].try_into().unwrap());
            }
            if fulltest(&hash, &work.target) {
                work.data[19] = nonce;
                return Ok(ScanOutput {
                    found: 1,
                    hashes_done: hashes,
                });
            }

            if nonce >= max_nonce {
                break;
            }
            nonce += 1;

            if hashes % 0x1000 == 0 && stop.load(Ordering::Relaxed) {
                break;
            }
        }

        work.data[19] = nonce;
        Ok(ScanOutput {
            found: 0,
            hashes_done: hashes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_keccak_is_built_in() {
        assert!(kernel_for(Algorithm::Keccak).is_some());
        assert!(kernel_for(Algorithm::X11).is_none());
        assert!(require_kernel(Algorithm::Heavy).is_err());
    }

    #[test]
    fn keccak_scan_exhausts_range_without_target() {
        let kernel = kernel_for(Algorithm::Keccak).unwrap();
        let mut work = Work::default();
        // impossible target: all zero except we need a hit only on exact 0
        work.data[19] = 0;
        let stop = AtomicBool::new(false);
        let out = kernel.scan(0, &mut work, 0xFF, &stop).unwrap();
        // zero target means only an all-zero hash wins; none will in 256 tries
        assert_eq!(out.found, 0);
        assert_eq!(out.hashes_done, 256);
        assert_eq!(work.data[19], 0xFF);
    }

    #[test]
    fn keccak_scan_finds_easy_target() {
        let kernel = kernel_for(Algorithm::Keccak).unwrap();
        let mut work = Work::default();
        work.target = [u32::MAX; 8]; // everything wins
        work.data[19] = 0x42;
        let stop = AtomicBool::new(false);
        let out = kernel.scan(0, &mut work, 0x1000, &stop).unwrap();
        assert_eq!(out.found, 1);
        assert_eq!(out.hashes_done, 1);
        assert_eq!(work.data[19], 0x42);
    }
}
