/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Dependency closure and composite symbol/vtable resolution.
//!
//! The ancestor project's dynamic linker (`dyld.rs`) builds up a symbol
//! table by searching across every loaded binary (`bins: &[MachO]`) in
//! load order, stopping at the first binary that exports the symbol being
//! looked up (see `Dyld::do_non_lazy_linking`/`do_lazy_link`). This module
//! reuses that exact search shape for kexts: a symbol a kext needs is
//! resolved by scanning the kext's dependency closure, in declared order,
//! for the first already-resident kext that exports it. C++ symbols
//! (vtables, pure-virtual stubs) need a second pass because, unlike plain C
//! exports, a vtable's slots must themselves be resolved recursively
//! against the *same* closure before the vtable symbol can be considered
//! defined.

use crate::error::{Error, Result};
use crate::macho::{MachO, Symbol, SymbolKind};
use crate::plist::{Dict, Value};
use std::collections::HashMap;

/// A four-component kext version (`major.minor.revision.stage`), packed
/// the way `OSKextParseVersionString` does for `CFBundleVersion`/
/// `OSBundleCompatibleVersion` comparisons. Missing trailing components
/// default to zero, so `"6.0"` and `"6.0.0.0"` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct KextVersion(u16, u16, u16, u16);

impl KextVersion {
    pub fn parse(s: &str) -> KextVersion {
        let mut parts = s.trim().splitn(4, '.').map(|p| p.parse::<u16>().unwrap_or(0));
        KextVersion(
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }
}

/// A kext's library dependency declarations, merged the way
/// `InternalKextCollectDependencies` merges `OSBundleLibraries` with the
/// architecture-specific `OSBundleLibraries_x86_64` table: the union of
/// both keyspaces (an x86_64-specific entry overrides a base entry for the
/// same bundle id), each bundle id listed once together with the minimum
/// compatible version the dependent kext requires of it.
pub fn declared_dependencies(info: &Dict) -> Vec<(String, KextVersion)> {
    let mut merged: Vec<(String, KextVersion)> = Vec::new();
    let mut index = std::collections::HashMap::new();

    let mut collect = |dict: &Dict, merged: &mut Vec<(String, KextVersion)>, index: &mut std::collections::HashMap<String, usize>| {
        for (key, value) in dict.iter() {
            let version = match value {
                Value::String(s) => KextVersion::parse(s),
                _ => KextVersion::default(),
            };
            if let Some(&idx) = index.get(key) {
                merged[idx].1 = version;
            } else {
                index.insert(key.to_string(), merged.len());
                merged.push((key.to_string(), version));
            }
        }
    };

    if let Some(base) = info.get_dict("OSBundleLibraries") {
        collect(base, &mut merged, &mut index);
    }
    if let Some(arch_specific) = info.get_dict("OSBundleLibraries_x86_64") {
        collect(arch_specific, &mut merged, &mut index);
    }
    merged
}

/// The version a resident kext's Info.plist advertises: `CFBundleVersion`
/// read directly, `OSBundleCompatibleVersion` (the oldest dependent
/// version it still satisfies) defaulting to the same value when absent,
/// matching `OSKext`'s own fallback.
fn resident_version(info: &Dict) -> (KextVersion, KextVersion) {
    let version = info.get_str("CFBundleVersion").map(KextVersion::parse).unwrap_or_default();
    let compatible = info.get_str("OSBundleCompatibleVersion").map(KextVersion::parse).unwrap_or(version);
    (version, compatible)
}

/// Is this a C++ mangled symbol (vtable, typeinfo, or mangled member
/// function)? Mirrors `MachoSymbolNameIsCxx`'s `__Z`/`__ZTV` style checks.
pub fn is_cxx_symbol(name: &str) -> bool {
    name.starts_with("__Z") || name.starts_with("_OSObj") || name.contains("10OSMetaClass")
}

/// If `name` is a vtable symbol (`__ZTV<len><ClassName>`), return the plain
/// class name it belongs to.
pub fn vtable_class_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("__ZTV")?;
    let digits_len = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits_len == 0 {
        return None;
    }
    let declared_len: usize = rest[..digits_len].parse().ok()?;
    rest.get(digits_len..digits_len + declared_len)
}

/// A node in the resolution closure: one kext's exported symbol table,
/// indexed for O(1) lookup. Sibling of [crate::macho::MachO::symbols] but
/// scoped to externally-visible, defined symbols only — the set a
/// dependent kext is allowed to bind against.
pub struct ExportTable<'a> {
    pub bundle_id: String,
    exports: HashMap<&'a str, &'a Symbol>,
}

impl<'a> ExportTable<'a> {
    pub fn build(bundle_id: impl Into<String>, macho: &'a MachO<'a>) -> Self {
        let mut exports = HashMap::new();
        for sym in macho.defined_symbols() {
            if sym.external {
                exports.insert(sym.name.as_str(), sym);
            }
        }
        ExportTable { bundle_id: bundle_id.into(), exports }
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.exports.get(name).copied()
    }
}

/// Resolve `symbol_name` by scanning `closure` in order, exactly as
/// `Dyld::do_non_lazy_linking` scans `bins` in load order: first match
/// wins.
pub fn resolve_symbol<'a>(closure: &'a [ExportTable<'a>], symbol_name: &str) -> Option<(&'a str, u64)> {
    for table in closure {
        if let Some(sym) = table.lookup(symbol_name) {
            return Some((table.bundle_id.as_str(), sym.value));
        }
    }
    None
}

/// A virtual method table: an ordered list of slots, each either already
/// resolved to an address or still pointing at a symbol name awaiting
/// resolution against the dependency closure.
#[derive(Debug, Clone)]
pub struct Vtable {
    pub class_name: String,
    pub slots: Vec<VtableSlot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VtableSlot {
    Resolved(u64),
    Unresolved(String),
}

impl Vtable {
    /// Resolve every still-unresolved slot against `closure`. Returns the
    /// names of any slots that could not be resolved (callers of
    /// `resolve_all` can turn the first one into a
    /// [Error::MissingDependency] with the owning kext's bundle id).
    pub fn resolve_all(&mut self, closure: &[ExportTable]) -> Vec<String> {
        let mut unresolved = Vec::new();
        for slot in &mut self.slots {
            if let VtableSlot::Unresolved(name) = slot {
                match resolve_symbol(closure, name) {
                    Some((_, addr)) => *slot = VtableSlot::Resolved(addr),
                    None => unresolved.push(name.clone()),
                }
            }
        }
        unresolved
    }
}

/// True for the well-known kernel pseudo-bundle-ids (`com.apple.kernel` and
/// every `com.apple.kpi.*` "kernel programming interface" library) that
/// `OSBundleLibraries` names instead of the synthetic `__kernel__` record
/// the Prelinked Context actually stores resident kexts under.
fn is_kernel_alias(bundle_id: &str) -> bool {
    bundle_id == "com.apple.kernel" || bundle_id.starts_with("com.apple.kpi.")
}

/// Build the ordered dependency closure for a kext given the full catalog
/// of already-resident kexts, following `InternalResolveDependencies`: a
/// depth-first walk over declared dependencies, a kext appears before any
/// dependency that only it needs (declaration order is preserved, not
/// topologically re-sorted, matching the original's insertion-order
/// semantics), and a missing bundle id is reported immediately rather than
/// deferred.
pub fn dependency_closure<'a>(
    bundle_id: &str,
    declared: &[(String, KextVersion)],
    resident: &'a HashMap<String, (Dict, MachO<'a>)>,
) -> Result<Vec<ExportTable<'a>>> {
    let mut closure = Vec::with_capacity(declared.len());
    let mut visited = std::collections::HashSet::new();
    let mut stack = declared.to_vec();

    while let Some((dep_id, required)) = stack.pop() {
        if !visited.insert(dep_id.clone()) {
            continue;
        }
        let lookup_id = if resident.contains_key(&dep_id) || !is_kernel_alias(&dep_id) {
            dep_id.as_str()
        } else {
            "__kernel__"
        };
        let (dep_info, macho) = resident.get(lookup_id).ok_or_else(|| Error::MissingDependency {
            bundle_id: bundle_id.to_string(),
            dependency: dep_id.clone(),
        })?;

        // `OSKextResolveDependencies` accepts a provider only when its
        // declared version covers the requirement: new enough to have the
        // symbol (`version >= required`) and not so far ahead that it has
        // dropped backward compatibility with it (`compatible <= required`).
        // The kernel pseudo-bundles never carry a version and are always
        // accepted.
        if required != KextVersion::default() && lookup_id != "__kernel__" {
            let (version, compatible) = resident_version(dep_info);
            if version < required || compatible > required {
                return Err(Error::MissingDependency {
                    bundle_id: bundle_id.to_string(),
                    dependency: format!("{dep_id} (resident version incompatible)"),
                });
            }
        }

        closure.push(ExportTable::build(dep_id.clone(), macho));
        for (transitive, transitive_required) in declared_dependencies(dep_info) {
            if !visited.contains(&transitive) {
                stack.push((transitive, transitive_required));
            }
        }
    }

    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plist::Value;

    #[test]
    fn vtable_class_name_extraction() {
        // __ZTV9IOService -> "IOService" (9 characters)
        assert_eq!(vtable_class_name("__ZTV9IOService"), Some("IOService"));
    }

    #[test]
    fn non_vtable_symbol_has_no_class_name() {
        assert_eq!(vtable_class_name("_IOLog"), None);
    }

    #[test]
    fn cxx_symbol_detection() {
        assert!(is_cxx_symbol("__ZN10IOAHCIPort5startEP9IOService"));
        assert!(!is_cxx_symbol("_IOLog"));
    }

    #[test]
    fn dependency_closure_reports_missing_dependency() {
        let resident: HashMap<String, (Dict, MachO)> = HashMap::new();
        let declared = vec![("com.apple.iokit.IOPCIFamily".to_string(), KextVersion::default())];
        let err = dependency_closure("com.example.test", &declared, &resident).unwrap_err();
        assert!(matches!(err, Error::MissingDependency { .. }));
    }

    #[test]
    fn dependency_closure_recurses_into_transitive_libraries() {
        let leaf_bytes = crate::macho::tests_support::minimal_macho_bytes();
        let leaf = MachO::parse(&leaf_bytes).unwrap();
        let mid_bytes = crate::macho::tests_support::minimal_macho_bytes();
        let mid = MachO::parse(&mid_bytes).unwrap();

        let mut mid_libs = Dict::new();
        mid_libs.insert("com.example.leaf", Value::String("1.0".into()));
        let mut mid_info = Dict::new();
        mid_info.insert("OSBundleLibraries", Value::Dict(mid_libs));

        let mut resident = HashMap::new();
        resident.insert("com.example.mid".to_string(), (mid_info, mid));
        resident.insert("com.example.leaf".to_string(), (Dict::new(), leaf));

        let declared = vec![("com.example.mid".to_string(), KextVersion::default())];
        let closure = dependency_closure("com.example.test", &declared, &resident).unwrap();
        assert_eq!(closure.len(), 2);
        assert!(closure.iter().any(|t| t.bundle_id == "com.example.leaf"));
    }

    #[test]
    fn kpi_alias_resolves_against_synthetic_kernel_record() {
        let kernel_bytes = crate::macho::tests_support::minimal_macho_bytes();
        let kernel_macho = MachO::parse(&kernel_bytes).unwrap();
        let mut resident = HashMap::new();
        resident.insert("__kernel__".to_string(), (Dict::new(), kernel_macho));

        let declared = vec![("com.apple.kpi.libkern".to_string(), KextVersion::default())];
        let closure = dependency_closure("com.example.test", &declared, &resident).unwrap();
        assert_eq!(closure.len(), 1);
        assert_eq!(closure[0].bundle_id, "com.apple.kpi.libkern");
    }

    #[test]
    fn dependency_closure_rejects_resident_version_too_old() {
        let leaf_bytes = crate::macho::tests_support::minimal_macho_bytes();
        let leaf = MachO::parse(&leaf_bytes).unwrap();
        let mut leaf_info = Dict::new();
        leaf_info.insert("CFBundleVersion", Value::String("1.0".into()));

        let mut resident = HashMap::new();
        resident.insert("com.example.leaf".to_string(), (leaf_info, leaf));

        let declared = vec![("com.example.leaf".to_string(), KextVersion::parse("2.0"))];
        let err = dependency_closure("com.example.test", &declared, &resident).unwrap_err();
        assert!(matches!(err, Error::MissingDependency { .. }));
    }

    #[test]
    fn dependency_declarations_pick_up_required_version() {
        let mut libs = Dict::new();
        libs.insert("com.example.leaf", Value::String("3.1".into()));
        let mut info = Dict::new();
        info.insert("OSBundleLibraries", Value::Dict(libs));

        let declared = declared_dependencies(&info);
        assert_eq!(declared, vec![("com.example.leaf".to_string(), KextVersion::parse("3.1"))]);
    }

    #[test]
    fn vtable_resolve_all_reports_unresolved_names() {
        let mut vtable = Vtable {
            class_name: "IOService".to_string(),
            slots: vec![VtableSlot::Unresolved("_IOLog".to_string())],
        };
        let closure: Vec<ExportTable> = Vec::new();
        let unresolved = vtable.resolve_all(&closure);
        assert_eq!(unresolved, vec!["_IOLog".to_string()]);
    }
}
