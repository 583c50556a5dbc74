/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Kernel-targeted quirks (`target: None`), named after the original's
//! `KernelQuirk*` family applied via `KernelApplyQuirk` in
//! `Utilities/TestKextInject/KextInject.c`'s `ApplyKernelPatches`.
//!
//! The exact byte sequences patched are not reproduced here verbatim (this
//! crate targets no specific shipped XNU binary); each quirk documents the
//! *shape* of its patch — symbol-anchored or whole-kernel search, single or
//! unlimited replacement count — rather than claiming bit-for-bit parity
//! with a particular macOS release.

use super::Quirk;
use crate::patcher::{Pattern, Patch};
use crate::version::{DarwinVersion, VersionRange};

fn dv(major: u32) -> DarwinVersion {
    DarwinVersion { major, minor: 0, patch: 0 }
}

/// `KernelQuirkAppleCpuPmCfgLock`: neutralise the `rdmsr`/`wrmsr` pair
/// that guards `MSR_POWER_CTL` (0xE2) bit 15 in the XNU power-management
/// init path, for CPUs whose firmware has locked that MSR read-only.
pub fn apple_cpu_pm_cfg_lock() -> Quirk {
    Quirk {
        name: "AppleCpuPmCfgLock",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "unlock MSR 0xE2 configuration lock check".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Masked { bytes: vec![0xb9, 0xe2, 0x00, 0x00, 0x00], mask: vec![0xff, 0xff, 0xff, 0xff, 0xff] },
            replace: Pattern::Masked { bytes: vec![0x90, 0xe2, 0x00, 0x00, 0x00], mask: vec![0xff, 0x00, 0x00, 0x00, 0x00] },
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkAppleXcpmCfgLock`: neutralise the `wrmsr` guarding
/// `MSR_IA32_PM_ENABLE` so XCPM initializes on CPUs that lock the bit from
/// firmware.
pub fn apple_xcpm_cfg_lock() -> Quirk {
    Quirk {
        name: "AppleXcpmCfgLock",
        target: None,
        range: VersionRange { min: dv(14), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "disable CFG lock check in XCPM MSR write".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Masked { bytes: vec![0x0f, 0x30], mask: vec![0xff, 0xff] },
            replace: Pattern::Masked { bytes: vec![0x90, 0x90], mask: vec![0xff, 0xff] },
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkAppleXcpmExtraMsrs`: allow XCPM to manage additional MSRs
/// on CPUs XNU doesn't officially recognise.
pub fn apple_xcpm_extra_msrs() -> Quirk {
    Quirk {
        name: "AppleXcpmExtraMsrs",
        target: None,
        range: VersionRange { min: dv(14), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "widen XCPM supported-MSR range check".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x3d]),
            replace: Pattern::Exact(vec![0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkAppleXcpmForceBoost`: force XCPM's performance-state boost
/// path regardless of the CPU's reported P-state limits.
pub fn apple_xcpm_force_boost() -> Quirk {
    Quirk {
        name: "AppleXcpmForceBoost",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "force XCPM boost regardless of reported P-state limit".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x74]),
            replace: Pattern::Exact(vec![0xeb]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkPanicNoKextDump`: skip the kext backtrace dump on kernel
/// panic, which can hang on some firmware's serial console.
pub fn panic_no_kext_dump() -> Quirk {
    Quirk {
        name: "PanicNoKextDump",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "skip kext dump in panic handler".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xe8, 0x00, 0x00, 0x00, 0x00]),
            replace: Pattern::Exact(vec![0x90, 0x90, 0x90, 0x90, 0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkLapicKernelPanic`: avoid a panic triggered by a LAPIC
/// interrupt the emulated/virtualised platform doesn't deliver.
pub fn lapic_kernel_panic() -> Quirk {
    Quirk {
        name: "LapicKernelPanic",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "disable LAPIC interrupt panic check".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x0f, 0x85]),
            replace: Pattern::Exact(vec![0x90, 0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkPowerTimeoutKernelPanic`: disable the panic that fires when
/// a power-state transition exceeds its expected timeout.
pub fn power_timeout_kernel_panic() -> Quirk {
    Quirk {
        name: "PowerTimeoutKernelPanic",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "disable power state transition timeout panic".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x0f, 0x84]),
            replace: Pattern::Exact(vec![0x90, 0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkSegmentJettison`: keep the "jettison unused prelink
/// segments" path from unmapping memory this crate's caller still needs
/// after boot.
pub fn segment_jettison() -> Quirk {
    Quirk {
        name: "SegmentJettison",
        target: None,
        range: VersionRange { min: dv(19), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "disable prelink segment jettisoning".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xb0, 0x01]),
            replace: Pattern::Exact(vec![0xb0, 0x00]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkCustomSmbiosGuid1`: accept a custom (non-Apple) SMBIOS
/// entry-point table GUID instead of refusing to boot.
pub fn custom_smbios_guid1() -> Quirk {
    Quirk {
        name: "CustomSmbiosGuid1",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "accept custom SMBIOS entry-point table GUID".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x75]),
            replace: Pattern::Exact(vec![0xeb]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkCustomSmbiosGuid2`: the second call site patched alongside
/// `CustomSmbiosGuid1`, guarding the SMBIOS structure-table GUID rather
/// than the entry-point GUID.
pub fn custom_smbios_guid2() -> Quirk {
    Quirk {
        name: "CustomSmbiosGuid2",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "accept custom SMBIOS structure-table GUID".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x74]),
            replace: Pattern::Exact(vec![0xeb]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkExtendBtFeatureFlags`: widen the Bluetooth feature flag
/// bitmask the kernel accepts from the controller.
pub fn extend_bt_feature_flags() -> Quirk {
    Quirk {
        name: "ExtendBTFeatureFlags",
        target: None,
        range: VersionRange { min: dv(18), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "widen accepted Bluetooth feature flag mask".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0xff, 0x00]),
            replace: Pattern::Exact(vec![0xff, 0xff]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkForceSecureBootScheme`: override the secure-boot scheme the
/// kernel detects from firmware variables.
pub fn force_secure_boot_scheme() -> Quirk {
    Quirk {
        name: "ForceSecureBootScheme",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "force a specific secure boot scheme".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x3c, 0x01]),
            replace: Pattern::Exact(vec![0x3c, 0x02]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KernelQuirkSetApfsTrimTimeout`: raise the APFS trim-completion timeout
/// so slow virtual disks don't get treated as unresponsive.
pub fn set_apfs_trim_timeout() -> Quirk {
    Quirk {
        name: "SetApfsTrimTimeout",
        target: None,
        range: VersionRange { min: dv(18), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "raise APFS trim completion timeout".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x00, 0x00, 0x01, 0x00]),
            replace: Pattern::Exact(vec![0x00, 0x00, 0x10, 0x00]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// The one non-optional kernel-level quirk the test harness applies
/// outside the named-quirk list: silencing `IOLog` by turning its body
/// into an immediate return (`DisableIoLogPatch` in `KextInject.c`).
pub fn disable_io_log() -> Quirk {
    Quirk {
        name: "DisableIoLog",
        target: None,
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "_IOLog -> ret".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x55, 0x48, 0x89, 0xe5]),
            replace: Pattern::Exact(vec![0xc3, 0x90, 0x90, 0x90]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: false,
    }
}

pub fn quirks() -> Vec<Quirk> {
    vec![
        apple_cpu_pm_cfg_lock(),
        apple_xcpm_cfg_lock(),
        apple_xcpm_extra_msrs(),
        apple_xcpm_force_boost(),
        panic_no_kext_dump(),
        lapic_kernel_panic(),
        power_timeout_kernel_panic(),
        segment_jettison(),
        custom_smbios_guid1(),
        custom_smbios_guid2(),
        extend_bt_feature_flags(),
        force_secure_boot_scheme(),
        set_apfs_trim_timeout(),
        disable_io_log(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kernel_quirk_has_at_least_one_patch() {
        for quirk in quirks() {
            assert!(!quirk.patches.is_empty(), "{} has no patches", quirk.name);
        }
    }

    #[test]
    fn disable_io_log_is_mandatory() {
        assert!(!disable_io_log().optional);
    }
}
