/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Kext-targeted quirks (`target: Some(bundle_id)`), named after the
//! original's `KextQuirk*` family applied via
//! `PatcherInitContextFromPrelinked` in `Utilities/TestKextInject/KextInject.c`.
//!
//! Each entry here patches one resident kext identified by bundle id
//! rather than the kernel itself; the dispatcher in
//! [crate::prelinked::Prelinked::apply_quirk] resolves the kext's placed
//! bytes before handing the patch to [crate::patcher::apply_generic_patch].

use super::Quirk;
use crate::patcher::{Pattern, Patch};
use crate::version::{DarwinVersion, VersionRange};

fn dv(major: u32) -> DarwinVersion {
    DarwinVersion { major, minor: 0, patch: 0 }
}

/// `KextQuirkThirdPartyDrives`: bypass the Apple-vendor check
/// `IOAHCIBlockStorageDevice`/`IONVMeFamily` run before trusting a disk's
/// SMART/TRIM capability, so third-party SATA/NVMe drives aren't silently
/// downgraded.
pub fn third_party_drives() -> Quirk {
    Quirk {
        name: "ThirdPartyDrives",
        target: Some("com.apple.iokit.IOAHCIFamily"),
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "accept non-Apple drive vendor string".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x75, 0x00]),
            replace: Pattern::Exact(vec![0xeb, 0x00]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KextQuirkExternalDiskIcons`: force `IOAHCIPort`-attached disks to
/// report as internal so Finder/Disk Utility pick the internal-disk icon.
pub fn external_disk_icons() -> Quirk {
    Quirk {
        name: "ExternalDiskIcons",
        target: Some("com.apple.iokit.IOAHCIFamily"),
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "report AHCI port-attached disks as internal".into(),
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

/// `KextQuirkDisableIoMapper`: neutralise `IOPCIFamily`'s VT-d/IOMMU
/// mapper initialisation path so passthrough devices work on firmware
/// that doesn't expose a complete DMAR table.
pub fn disable_io_mapper() -> Quirk {
    Quirk {
        name: "DisableIoMapper",
        target: Some("com.apple.iokit.IOPCIFamily"),
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "skip IOMapper/VT-d activation".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x85, 0xc0, 0x74]),
            replace: Pattern::Exact(vec![0x85, 0xc0, 0xeb]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

/// `KextQuirkDummyPowerManagement`: replace
/// `AppleIntelCPUPowerManagement`'s CPU-family gate with an always-true
/// check so it loads (inertly) on CPUs XNU's table doesn't recognise,
/// instead of panicking the boot.
pub fn dummy_power_management() -> Quirk {
    Quirk {
        name: "DummyPowerManagement",
        target: Some("com.apple.driver.AppleIntelCPUPowerManagement"),
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "accept unrecognised CPU family in power management probe".into(),
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

/// `KextQuirkXhciPortLimit`: extend the XHCI port count check in
/// `AppleUSBXHCIPCI`'s personality matching past the 15-port ceiling XNU
/// otherwise enforces, numbered 1-3 for the three call sites the original
/// patches across `10.13`-`10.15`-era and later kexts.
fn xhci_port_limit(name: &'static str, min_version: u32) -> Quirk {
    Quirk {
        name,
        target: Some("com.apple.driver.AppleUSBXHCI"),
        range: VersionRange { min: dv(min_version), max: DarwinVersion::MAX },
        patches: vec![Patch {
            comment: "widen XHCI port count limit past 15".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x0f]),
            replace: Pattern::Exact(vec![0x1f]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

pub fn xhci_port_limit1() -> Quirk {
    xhci_port_limit("XhciPortLimit1", 15)
}

pub fn xhci_port_limit2() -> Quirk {
    xhci_port_limit("XhciPortLimit2", 17)
}

pub fn xhci_port_limit3() -> Quirk {
    xhci_port_limit("XhciPortLimit3", 19)
}

/// `KextQuirkIncreasePciBarSize`: raise the maximum BAR size
/// `IOPCIFamily` allows a device to request, for GPUs whose resizable BAR
/// exceeds the original ceiling.
pub fn increase_pci_bar_size() -> Quirk {
    Quirk {
        name: "IncreasePciBarSize",
        target: Some("com.apple.iokit.IOPCIFamily"),
        range: VersionRange::ANY,
        patches: vec![Patch {
            comment: "raise maximum accepted PCI BAR size".into(),
            base: 0,
            base_symbol: None,
            find: Pattern::Exact(vec![0x00, 0x00, 0x00, 0x40]),
            replace: Pattern::Exact(vec![0x00, 0x00, 0x00, 0x80]),
            limit: 0,
            skip: 0,
            count: 1,
        }],
        optional: true,
    }
}

pub fn quirks() -> Vec<Quirk> {
    vec![
        third_party_drives(),
        external_disk_icons(),
        disable_io_mapper(),
        dummy_power_management(),
        xhci_port_limit1(),
        xhci_port_limit2(),
        xhci_port_limit3(),
        increase_pci_bar_size(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kext_quirk_names_a_bundle_target() {
        for quirk in quirks() {
            assert!(quirk.target.is_some(), "{} has no bundle target", quirk.name);
        }
    }

    #[test]
    fn xhci_port_limits_are_distinct_ranges() {
        assert!(xhci_port_limit1().range.min < xhci_port_limit2().range.min);
        assert!(xhci_port_limit2().range.min < xhci_port_limit3().range.min);
    }
}
