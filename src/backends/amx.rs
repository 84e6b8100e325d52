//! AMX backend implementation (x86_64 Linux)
//!
//! This backend drives the AMX tile registers (`tmm0`..`tmm7`) directly with
//! inline assembly: `ldtilecfg`, `tileloadd`, `tdpbssd`, `tilestored` and
//! `tilerelease`. AMX-TILE and AMX-INT8 ship on Intel Sapphire Rapids (2023+)
//! and later server parts.
//!
//! Linux only hands out the 8 KB tile data state after the process asks for
//! it with `arch_prctl(ARCH_REQ_XCOMP_PERM, XFEATURE_XTILEDATA)`; touching a
//! tile register before that raises `SIGILL`.
//!
//! # Safety
//!
//! Tile instructions take the slot number as part of the encoding, so every
//! instruction is dispatched through a `match` over the eight slots. Before
//! any instruction is issued the backend checks that permission was granted,
//! that a palette is active, that the slot is configured and that the
//! buffer spans exactly `rows × stride` bytes. The hardware never reads or
//! writes outside the slice it was given.

use std::arch::asm;
use std::marker::PhantomData;

use super::{check_extent, TileOps};
use crate::{Backend, Result, TileError, TileLimits, TilePalette, TileSlot};

/// `arch_prctl` request for permission to use an extended state component
const ARCH_REQ_XCOMP_PERM: libc::c_long = 0x1023;

/// XSAVE state component number of the tile data registers
const XFEATURE_XTILEDATA: libc::c_long = 18;

/// `ldtilecfg` reads a 64-byte, 64-byte aligned image
#[repr(C, align(64))]
struct TileConfigImage([u8; 64]);

/// Expand `$body` once per architectural slot with `$n` bound to the slot
/// index as a constant.
macro_rules! with_slot {
    ($slot:expr, $n:ident => $body:block) => {
        match $slot.index() {
            0 => {
                const $n: u8 = 0;
                $body
            }
            1 => {
                const $n: u8 = 1;
                $body
            }
            2 => {
                const $n: u8 = 2;
                $body
            }
            3 => {
                const $n: u8 = 3;
                $body
            }
            4 => {
                const $n: u8 = 4;
                $body
            }
            5 => {
                const $n: u8 = 5;
                $body
            }
            6 => {
                const $n: u8 = 6;
                $body
            }
            7 => {
                const $n: u8 = 7;
                $body
            }
            _ => unreachable!("TileSlot is always below 8"),
        }
    };
}

/// Second VEX byte of `tdpbssd`: W0, inverted vvvv = `b`, L0, pp = F2
const fn tdpbssd_vex_byte(b: u8) -> u8 {
    ((!b & 0x0f) << 3) | 0x03
}

/// ModRM of `tdpbssd`: register form, reg = destination, r/m = `a`
const fn tdpbssd_modrm(dst: u8, a: u8) -> u8 {
    0xc0 | (dst << 3) | a
}

/// AMX tile unit for the calling thread
///
/// The value is `!Send`: tile registers belong to the thread that configured
/// them.
pub struct AmxTiles {
    permitted: bool,
    palette: Option<TilePalette>,
    _thread_bound: PhantomData<*const ()>,
}

impl Default for AmxTiles {
    fn default() -> Self {
        Self::new()
    }
}

impl AmxTiles {
    /// A backend that has not yet requested permission
    pub fn new() -> Self {
        AmxTiles {
            permitted: false,
            palette: None,
            _thread_bound: PhantomData,
        }
    }

    fn active_palette(&self) -> Result<TilePalette> {
        if !self.permitted {
            return Err(TileError::ContractViolation(
                "tile data permission has not been granted".to_string(),
            ));
        }
        self.palette.ok_or_else(|| {
            TileError::ContractViolation("no tile configuration is active".to_string())
        })
    }
}

impl TileOps for AmxTiles {
    fn backend(&self) -> Backend {
        Backend::Amx
    }

    fn request_permission(&mut self) -> Result<()> {
        // SAFETY: ARCH_REQ_XCOMP_PERM only extends the set of XSAVE components
        // the process may use; it takes two integer arguments and touches no
        // caller memory.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_arch_prctl,
                ARCH_REQ_XCOMP_PERM,
                XFEATURE_XTILEDATA,
            )
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            return Err(TileError::CapabilityDenied { errno });
        }
        self.permitted = true;
        Ok(())
    }

    fn configure(&mut self, palette: &TilePalette) -> Result<()> {
        palette.validate(&TileLimits::default())?;
        if !self.permitted {
            return Err(TileError::ContractViolation(
                "configure before tile data permission was granted".to_string(),
            ));
        }
        let image = TileConfigImage(palette.to_config_bytes());
        // SAFETY:
        // 1. Permission for XTILEDATA was granted on this process
        // 2. `image` is a 64-byte aligned, fully initialised palette 1 image
        // 3. The palette fits the palette 1 limits (validated above)
        unsafe {
            asm!(
                "ldtilecfg [{cfg}]",
                cfg = in(reg) image.0.as_ptr(),
                options(nostack, readonly, preserves_flags)
            );
        }
        self.palette = Some(*palette);
        Ok(())
    }

    fn load(&mut self, slot: TileSlot, src: &[u8], stride: usize) -> Result<()> {
        let palette = self.active_palette()?;
        check_extent(&palette, slot, src.len(), stride)?;
        let base = src.as_ptr();
        // SAFETY: check_extent guarantees `src` holds `rows` rows of `stride`
        // bytes with `stride >= colsb`, so the tile read stays inside `src`.
        unsafe {
            with_slot!(slot, S => {
                asm!(
                    "tileloadd tmm{s}, [{base} + {stride} * 1]",
                    s = const S,
                    base = in(reg) base,
                    stride = in(reg) stride,
                    options(nostack, readonly, preserves_flags)
                );
            });
        }
        Ok(())
    }

    fn dot_product_accumulate(&mut self, dst: TileSlot, a: TileSlot, b: TileSlot) -> Result<()> {
        let palette = self.active_palette()?;
        palette.check_dot_product(dst, a, b)?;
        // Hand-encoded: the assembler rejects repeated tmm operands, and the
        // nested dispatch below contains those combinations as dead arms.
        // SAFETY: the three slots are distinct and configured with compatible
        // geometry (checked above); the instruction touches no memory.
        unsafe {
            with_slot!(dst, D => {
                with_slot!(a, A => {
                    with_slot!(b, B => {
                        asm!(
                            ".byte 0xc4, 0xe2, {vex}, 0x5e, {modrm}",
                            vex = const tdpbssd_vex_byte(B),
                            modrm = const tdpbssd_modrm(D, A),
                            options(nostack, nomem, preserves_flags)
                        );
                    });
                });
            });
        }
        Ok(())
    }

    fn store(&mut self, slot: TileSlot, dst: &mut [u8], stride: usize) -> Result<()> {
        let palette = self.active_palette()?;
        check_extent(&palette, slot, dst.len(), stride)?;
        let base = dst.as_mut_ptr();
        // SAFETY: check_extent guarantees `dst` holds `rows` rows of `stride`
        // bytes with `stride >= colsb`, so the tile write stays inside `dst`.
        unsafe {
            with_slot!(slot, S => {
                asm!(
                    "tilestored [{base} + {stride} * 1], tmm{s}",
                    s = const S,
                    base = in(reg) base,
                    stride = in(reg) stride,
                    options(nostack, preserves_flags)
                );
            });
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.palette.take().is_some() {
            // SAFETY: a configuration is active on this thread, so the tile
            // state exists and may be returned to the init state.
            unsafe {
                asm!("tilerelease", options(nostack, nomem, preserves_flags));
            }
        }
    }
}
