//! Cross-object symbol resolution.
//!
//! Resolution is two explicit passes over the input objects, in the link
//! order the caller supplied. Pass one merges every GLOBAL and WEAK
//! definition into the [`GlobalSymbolTable`]; pass two validates that every
//! relocation's referenced name resolves somewhere. Both passes accumulate
//! their failures instead of stopping at the first, so one faulty input
//! reports all of its problems in a single link attempt.
//!
//! LOCAL symbols never enter the table: a private definition in one object
//! must not satisfy a reference from another.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::error::{DuplicateDef, LinkError, LinkResult, UndefinedRef};
use crate::object_file::{Binding, ObjectFile, SymbolPlace};

/// A name resolved to its single winning definition.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedSymbol {
    /// Index of the defining object in the input order.
    pub object: usize,
    /// Section index within the defining object.
    pub section: usize,
    /// Offset within that section.
    pub offset: u64,
    pub weak: bool,
}

/// Merged view of all GLOBAL/WEAK definitions across the inputs. Built
/// fresh per link.
#[derive(Debug, Default)]
pub struct GlobalSymbolTable {
    map: HashMap<String, ResolvedSymbol>,
}

impl GlobalSymbolTable {
    /// Merges all definitions and validates all references.
    ///
    /// Tie-breaks: a strong definition always beats a weak one regardless of
    /// order; two strong definitions of one name are a conflict; of two weak
    /// definitions the first in input order wins.
    pub fn resolve(objects: &[ObjectFile]) -> LinkResult<Self> {
        let mut table = GlobalSymbolTable::default();
        let mut duplicates = Vec::new();

        for (obj_index, obj) in objects.iter().enumerate() {
            for sym in &obj.symbols {
                if sym.binding == Binding::Local {
                    continue;
                }
                let SymbolPlace::Defined { section, offset } = sym.place else {
                    continue;
                };
                let weak = sym.binding == Binding::Weak;
                let candidate = ResolvedSymbol {
                    object: obj_index,
                    section,
                    offset,
                    weak,
                };
                match table.map.entry(sym.name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(candidate);
                    }
                    Entry::Occupied(mut slot) => {
                        let existing = *slot.get();
                        if weak {
                            // Weak yields to whatever is already there.
                        } else if existing.weak {
                            slot.insert(candidate);
                        } else {
                            duplicates.push(DuplicateDef {
                                name: sym.name.clone(),
                                first: objects[existing.object].name.clone(),
                                second: obj.name.clone(),
                            });
                        }
                    }
                }
            }
        }

        if !duplicates.is_empty() {
            return Err(LinkError::DuplicateSymbol(duplicates));
        }

        let mut undefined = Vec::new();
        let mut reported: HashSet<(usize, String)> = HashSet::new();
        for (obj_index, obj) in objects.iter().enumerate() {
            for sec in &obj.sections {
                for reloc in &sec.relocations {
                    if table.reference_resolves(obj, &reloc.symbol) {
                        continue;
                    }
                    if reported.insert((obj_index, reloc.symbol.clone())) {
                        undefined.push(UndefinedRef {
                            name: reloc.symbol.clone(),
                            referenced_by: obj.name.clone(),
                        });
                    }
                }
            }
        }

        if !undefined.is_empty() {
            return Err(LinkError::UndefinedSymbol(undefined));
        }

        Ok(table)
    }

    /// Whether a reference made from `obj` to `name` resolves: to a defined
    /// symbol in `obj` itself (the only way LOCALs resolve), to a global
    /// definition, or to zero via an undefined WEAK declaration.
    fn reference_resolves(&self, obj: &ObjectFile, name: &str) -> bool {
        if obj.defined_symbol(name).is_some() {
            return true;
        }
        if self.map.contains_key(name) {
            return true;
        }
        matches!(
            obj.symbol_by_name(name),
            Some(sym) if sym.binding == Binding::Weak && sym.place == SymbolPlace::Undefined
        )
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedSymbol> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_file::{RelocKind, Relocation, Section, SectionKind, Symbol};

    fn code_section(relocs: Vec<Relocation>) -> Section {
        Section {
            name: ".text".to_string(),
            kind: SectionKind::Code,
            align: 16,
            data: vec![0x90; 32],
            size: 32,
            relocations: relocs,
        }
    }

    fn defined(name: &str, binding: Binding, offset: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding,
            place: SymbolPlace::Defined { section: 0, offset },
            size: 0,
        }
    }

    fn undefined(name: &str, binding: Binding) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding,
            place: SymbolPlace::Undefined,
            size: 0,
        }
    }

    fn reloc_to(name: &str) -> Relocation {
        Relocation {
            offset: 0,
            symbol: name.to_string(),
            kind: RelocKind::Abs64,
            addend: 0,
        }
    }

    fn obj(name: &str, sections: Vec<Section>, symbols: Vec<Symbol>) -> ObjectFile {
        ObjectFile::new(name.to_string(), sections, symbols)
    }

    #[test]
    fn strong_beats_weak_in_either_order() {
        for weak_first in [true, false] {
            let weak = obj(
                "weak.o",
                vec![code_section(vec![])],
                vec![defined("f", Binding::Weak, 8)],
            );
            let strong = obj(
                "strong.o",
                vec![code_section(vec![])],
                vec![defined("f", Binding::Global, 16)],
            );
            let objects = if weak_first {
                vec![weak, strong]
            } else {
                vec![strong, weak]
            };
            let table = GlobalSymbolTable::resolve(&objects).unwrap();
            let resolved = table.get("f").unwrap();
            assert!(!resolved.weak);
            assert_eq!(resolved.offset, 16);
            assert_eq!(objects[resolved.object].name, "strong.o");
        }
    }

    #[test]
    fn first_weak_wins_among_weaks() {
        let a = obj(
            "a.o",
            vec![code_section(vec![])],
            vec![defined("f", Binding::Weak, 4)],
        );
        let b = obj(
            "b.o",
            vec![code_section(vec![])],
            vec![defined("f", Binding::Weak, 12)],
        );
        let table = GlobalSymbolTable::resolve(&[a, b]).unwrap();
        let resolved = table.get("f").unwrap();
        assert_eq!(resolved.object, 0);
        assert_eq!(resolved.offset, 4);
    }

    #[test]
    fn duplicate_strong_definitions_are_all_reported() {
        let a = obj(
            "a.o",
            vec![code_section(vec![])],
            vec![defined("f", Binding::Global, 0), defined("g", Binding::Global, 8)],
        );
        let b = obj(
            "b.o",
            vec![code_section(vec![])],
            vec![defined("f", Binding::Global, 0), defined("g", Binding::Global, 8)],
        );
        let err = GlobalSymbolTable::resolve(&[a, b]).unwrap_err();
        match err {
            LinkError::DuplicateSymbol(dups) => {
                assert_eq!(dups.len(), 2);
                assert!(dups.iter().all(|d| d.first == "a.o" && d.second == "b.o"));
            }
            other => panic!("expected DuplicateSymbol, got {other}"),
        }
    }

    #[test]
    fn locals_do_not_leak_across_objects() {
        let a = obj(
            "a.o",
            vec![code_section(vec![])],
            vec![defined("helper", Binding::Local, 0)],
        );
        let b = obj(
            "b.o",
            vec![code_section(vec![reloc_to("helper")])],
            vec![undefined("helper", Binding::Global)],
        );
        let err = GlobalSymbolTable::resolve(&[a, b]).unwrap_err();
        match err {
            LinkError::UndefinedSymbol(refs) => {
                assert_eq!(refs.len(), 1);
                assert_eq!(refs[0].name, "helper");
                assert_eq!(refs[0].referenced_by, "b.o");
            }
            other => panic!("expected UndefinedSymbol, got {other}"),
        }
    }

    #[test]
    fn locals_resolve_within_their_own_object() {
        let a = obj(
            "a.o",
            vec![code_section(vec![reloc_to("helper")])],
            vec![defined("helper", Binding::Local, 4)],
        );
        GlobalSymbolTable::resolve(&[a]).unwrap();
    }

    #[test]
    fn all_undefined_references_reported_together() {
        let a = obj(
            "a.o",
            vec![code_section(vec![reloc_to("foo"), reloc_to("bar")])],
            vec![
                undefined("foo", Binding::Global),
                undefined("bar", Binding::Global),
            ],
        );
        let err = GlobalSymbolTable::resolve(&[a]).unwrap_err();
        match err {
            LinkError::UndefinedSymbol(refs) => {
                let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, vec!["foo", "bar"]);
            }
            other => panic!("expected UndefinedSymbol, got {other}"),
        }
    }

    #[test]
    fn undefined_weak_reference_is_allowed() {
        let a = obj(
            "a.o",
            vec![code_section(vec![reloc_to("maybe")])],
            vec![undefined("maybe", Binding::Weak)],
        );
        GlobalSymbolTable::resolve(&[a]).unwrap();
    }
}
