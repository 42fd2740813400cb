//! Core linker orchestration.
//!
//! [`Linker`] drives one link as a strict sequential pipeline over the
//! loaded inputs: resolve symbols, lay out sections, apply relocations,
//! emit the image. Each stage needs the complete output of the previous
//! one, so there is no overlap between stages. A `Linker` holds no global
//! state; independent links over disjoint inputs are safe to run
//! concurrently.

use crate::arch::{Architecture, PatchError};
use crate::error::{LinkError, LinkResult, UndefinedRef};
use crate::layout::LayoutPlan;
use crate::object_file::{Binding, ObjectFile, SectionKind, SymbolPlace};
use crate::reader;
use crate::resolver::GlobalSymbolTable;
use crate::writer::{self, Image};

/// Conventional load address for x86_64 ELF executables.
pub const DEFAULT_BASE_ADDR: u64 = 0x400000;
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 0x1000_0000;

/// Caller-supplied knobs for one link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Symbol the image's entry point is taken from.
    pub entry_symbol: String,
    pub base_address: u64,
    /// Upper bound on the laid-out memory span, BSS included.
    pub max_image_size: u64,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            entry_symbol: "_start".to_string(),
            base_address: DEFAULT_BASE_ADDR,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }
}

pub struct Linker<A: Architecture> {
    arch: A,
    options: LinkOptions,
    objects: Vec<ObjectFile>,
}

impl<A: Architecture> Linker<A> {
    pub fn new(arch: A, options: LinkOptions) -> Self {
        Self {
            arch,
            options,
            objects: Vec::new(),
        }
    }

    /// Parses one input (object file or archive) and appends its objects in
    /// link order.
    pub fn add_input(&mut self, name: &str, data: &[u8]) -> LinkResult<()> {
        let objects = reader::read_input(name, data, self.arch.object_arch())?;
        tracing::debug!("loaded {} object(s) from {name}", objects.len());
        self.objects.extend(objects);
        Ok(())
    }

    /// Appends an already-parsed object.
    pub fn add_object(&mut self, object: ObjectFile) {
        self.objects.push(object);
    }

    /// Runs the pipeline to completion and returns the image. No partial
    /// image exists on any failure.
    pub fn link(&self) -> LinkResult<Image> {
        let symtab = GlobalSymbolTable::resolve(&self.objects)?;
        tracing::debug!("resolved {} global symbol(s)", symtab.len());

        let mut plan = LayoutPlan::compute(
            &self.objects,
            self.options.base_address,
            self.options.max_image_size,
        )?;

        self.relocate(&symtab, &mut plan)?;
        let entry_point = self.entry_address(&symtab, &plan)?;
        tracing::debug!("entry point at 0x{entry_point:x}");

        Ok(writer::build_image(&plan, entry_point, &self.arch))
    }

    /// Patches every relocation of every placed section into its segment's
    /// bytes. Runs only after layout, since both the patched location and
    /// the target address are final addresses.
    fn relocate(&self, symtab: &GlobalSymbolTable, plan: &mut LayoutPlan) -> LinkResult<()> {
        for seg_index in 0..plan.segments.len() {
            let mut patches = Vec::new();
            for placed in &plan.segments[seg_index].sections {
                let obj = &self.objects[placed.object];
                let sec = &obj.sections[placed.section];
                let section_va = plan.segments[seg_index].virtual_address + placed.offset;
                for reloc in &sec.relocations {
                    let s = self
                        .symbol_value(symtab, plan, placed.object, &reloc.symbol)
                        .ok_or_else(|| {
                            LinkError::UndefinedSymbol(vec![UndefinedRef {
                                name: reloc.symbol.clone(),
                                referenced_by: obj.name.clone(),
                            }])
                        })?;
                    let p = section_va + reloc.offset;
                    patches.push(Patch {
                        segment_offset: placed.offset + reloc.offset,
                        kind: reloc.kind,
                        p,
                        s,
                        addend: reloc.addend,
                        object: obj.name.clone(),
                        symbol: reloc.symbol.clone(),
                        reloc_offset: reloc.offset,
                    });
                }
            }

            let segment = &mut plan.segments[seg_index];
            for patch in patches {
                self.arch
                    .apply_relocation(
                        patch.kind,
                        patch.segment_offset,
                        patch.p,
                        patch.s,
                        patch.addend,
                        &mut segment.data,
                    )
                    .map_err(|e| match e {
                        PatchError::Overflow { value, width } => LinkError::RelocationOverflow {
                            object: patch.object,
                            symbol: patch.symbol,
                            offset: patch.reloc_offset,
                            value,
                            width,
                        },
                        PatchError::OutOfBounds { offset, len } => LinkError::MalformedObject {
                            name: patch.object,
                            reason: format!(
                                "relocation patch at 0x{offset:x} outside segment ({len} bytes)"
                            ),
                        },
                    })?;
            }
        }
        Ok(())
    }

    /// Final value of a symbol referenced from `obj_index`: a definition in
    /// the referencing object itself (the only way LOCALs resolve), else the
    /// global definition, else zero for an undefined WEAK declaration.
    fn symbol_value(
        &self,
        symtab: &GlobalSymbolTable,
        plan: &LayoutPlan,
        obj_index: usize,
        name: &str,
    ) -> Option<u64> {
        let obj = &self.objects[obj_index];
        if let Some((_, section, offset)) = obj.defined_symbol(name) {
            return Some(plan.section_address(obj_index, section)? + offset);
        }
        if let Some(resolved) = symtab.get(name) {
            return Some(plan.section_address(resolved.object, resolved.section)? + resolved.offset);
        }
        match obj.symbol_by_name(name) {
            Some(sym) if sym.binding == Binding::Weak && sym.place == SymbolPlace::Undefined => {
                Some(0)
            }
            _ => None,
        }
    }

    fn entry_address(&self, symtab: &GlobalSymbolTable, plan: &LayoutPlan) -> LinkResult<u64> {
        let name = &self.options.entry_symbol;
        let missing = |reason: String| LinkError::MissingEntryPoint {
            name: name.clone(),
            reason,
        };
        let resolved = symtab
            .get(name)
            .ok_or_else(|| missing("not defined by any input object".to_string()))?;
        let (seg_index, offset) = plan
            .placement(resolved.object, resolved.section)
            .ok_or_else(|| missing("defined in a section that was not laid out".to_string()))?;
        let segment = &plan.segments[seg_index];
        if segment.kind != SectionKind::Code {
            return Err(missing(format!(
                "defined in {} rather than the code segment",
                segment.name
            )));
        }
        Ok(segment.virtual_address + offset + resolved.offset)
    }
}

struct Patch {
    segment_offset: u64,
    kind: crate::object_file::RelocKind,
    p: u64,
    s: u64,
    addend: i64,
    object: String,
    symbol: String,
    reloc_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::object_file::{RelocKind, Relocation, Section, Symbol};

    fn section(name: &str, kind: SectionKind, data: Vec<u8>) -> Section {
        let size = data.len() as u64;
        Section {
            name: name.to_string(),
            kind,
            align: 16,
            data,
            size,
            relocations: Vec::new(),
        }
    }

    fn global(name: &str, sec: usize, offset: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            binding: Binding::Global,
            place: SymbolPlace::Defined {
                section: sec,
                offset,
            },
            size: 0,
        }
    }

    fn linker_with(objects: Vec<ObjectFile>) -> Linker<X86_64> {
        let mut linker = Linker::new(X86_64, LinkOptions::default());
        for o in objects {
            linker.add_object(o);
        }
        linker
    }

    #[test]
    fn entry_point_lands_on_the_entry_symbol() {
        let obj = ObjectFile::new(
            "a.o".to_string(),
            vec![section(".text", SectionKind::Code, vec![0x90; 32])],
            vec![global("_start", 0, 8)],
        );
        let image = linker_with(vec![obj]).link().unwrap();
        assert_eq!(image.entry_point, DEFAULT_BASE_ADDR + 0x1000 + 8);
    }

    #[test]
    fn missing_entry_symbol_is_an_error() {
        let obj = ObjectFile::new(
            "a.o".to_string(),
            vec![section(".text", SectionKind::Code, vec![0x90; 4])],
            vec![global("main", 0, 0)],
        );
        let err = linker_with(vec![obj]).link().unwrap_err();
        assert!(matches!(err, LinkError::MissingEntryPoint { .. }));
    }

    #[test]
    fn entry_symbol_outside_code_is_an_error() {
        let obj = ObjectFile::new(
            "a.o".to_string(),
            vec![section(".data", SectionKind::Data, vec![0; 16])],
            vec![global("_start", 0, 0)],
        );
        let err = linker_with(vec![obj]).link().unwrap_err();
        match err {
            LinkError::MissingEntryPoint { reason, .. } => {
                assert!(reason.contains(".data"));
            }
            other => panic!("expected MissingEntryPoint, got {other}"),
        }
    }

    #[test]
    fn cross_object_absolute_reference_is_patched() {
        let mut text = section(".text", SectionKind::Code, vec![0x90; 16]);
        text.relocations.push(Relocation {
            offset: 4,
            symbol: "value".to_string(),
            kind: RelocKind::Abs64,
            addend: 0,
        });
        let a = ObjectFile::new(
            "a.o".to_string(),
            vec![text],
            vec![
                global("_start", 0, 0),
                Symbol {
                    name: "value".to_string(),
                    binding: Binding::Global,
                    place: SymbolPlace::Undefined,
                    size: 0,
                },
            ],
        );
        let b = ObjectFile::new(
            "b.o".to_string(),
            vec![section(".data", SectionKind::Data, vec![0xEE; 24])],
            vec![global("value", 0, 8)],
        );
        let image = linker_with(vec![a, b]).link().unwrap();

        // .text occupies the first content page; the patch sits 4 bytes in.
        let patched =
            u64::from_le_bytes(image.bytes[0x1000 + 4..0x1000 + 12].try_into().unwrap());
        // .data is the second laid-out segment, one page after .text.
        assert_eq!(patched, DEFAULT_BASE_ADDR + 0x2000 + 8);
    }
}
