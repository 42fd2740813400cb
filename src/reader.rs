//! Object file reader.
//!
//! Parses ELF relocatable objects (and `!<arch>` static library archives)
//! into the crate's own [`ObjectFile`] model using the `object` crate.
//! Parsing is local: nothing outside the returned value is touched, so a
//! failed parse leaves no state behind.
//!
//! ELF details are flattened on the way in: section symbols and
//! section-targeted relocations become synthesized local symbols named after
//! their section, so every relocation in the model refers to a symbol name.

use std::collections::HashMap;

use object::read::archive::ArchiveFile;
use object::read::{Object, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex};
use object::{ObjectKind, RelocationKind, SymbolKind};

use crate::error::{LinkError, LinkResult};
use crate::object_file::{
    Binding, ObjectFile, RelocKind, Relocation, Section, SectionKind, Symbol, SymbolPlace,
};

const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

fn malformed(name: &str, reason: impl Into<String>) -> LinkError {
    LinkError::MalformedObject {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Reads one input, which may be a single relocatable object or a static
/// library archive. Archive members are read in archive order.
pub fn read_input(
    name: &str,
    data: &[u8],
    arch: object::Architecture,
) -> LinkResult<Vec<ObjectFile>> {
    if !data.starts_with(ARCHIVE_MAGIC) {
        return Ok(vec![read_object(name, data, arch)?]);
    }

    let archive =
        ArchiveFile::parse(data).map_err(|e| malformed(name, format!("bad archive: {e}")))?;
    let mut objects = Vec::new();
    for member in archive.members() {
        let member = member.map_err(|e| malformed(name, format!("bad archive member: {e}")))?;
        let member_name = String::from_utf8_lossy(member.name()).to_string();
        let bytes = member
            .data(data)
            .map_err(|e| malformed(name, format!("archive member {member_name}: {e}")))?;
        let full_name = format!("{name}({member_name})");
        objects.push(read_object(&full_name, bytes, arch)?);
    }
    Ok(objects)
}

/// Parses a single relocatable object into the model, or fails with
/// [`LinkError::MalformedObject`].
pub fn read_object(name: &str, data: &[u8], arch: object::Architecture) -> LinkResult<ObjectFile> {
    let obj = object::File::parse(data)
        .map_err(|e| malformed(name, format!("failed to parse: {e}")))?;

    if obj.architecture() != arch {
        return Err(malformed(
            name,
            format!("unsupported architecture {:?}", obj.architecture()),
        ));
    }
    if obj.kind() != ObjectKind::Relocatable {
        return Err(malformed(
            name,
            format!("not a relocatable object (kind {:?})", obj.kind()),
        ));
    }

    // Sections we care about; everything else (symtab, notes, debug info) is
    // skipped up front.
    let mut sections = Vec::new();
    let mut index_map: HashMap<SectionIndex, usize> = HashMap::new();
    for sec in obj.sections() {
        let kind = match sec.kind() {
            object::SectionKind::Text => SectionKind::Code,
            object::SectionKind::ReadOnlyData | object::SectionKind::ReadOnlyString => {
                SectionKind::Rodata
            }
            object::SectionKind::Data => SectionKind::Data,
            object::SectionKind::UninitializedData => SectionKind::Bss,
            other => {
                tracing::debug!(
                    "{name}: skipping section {} (kind {other:?})",
                    sec.name().unwrap_or("?")
                );
                continue;
            }
        };
        let sec_name = sec
            .name()
            .map_err(|e| malformed(name, format!("bad section name: {e}")))?
            .to_string();
        let align = sec.align().max(1);
        if !align.is_power_of_two() {
            return Err(malformed(
                name,
                format!("section {sec_name}: alignment {align} is not a power of two"),
            ));
        }
        let size = sec.size();
        let content = if kind == SectionKind::Bss {
            Vec::new()
        } else {
            let d = sec
                .data()
                .map_err(|e| malformed(name, format!("section {sec_name}: {e}")))?;
            if d.len() as u64 != size {
                return Err(malformed(
                    name,
                    format!(
                        "section {sec_name}: content is {} bytes but header claims {size}",
                        d.len()
                    ),
                ));
            }
            d.to_vec()
        };
        index_map.insert(sec.index(), sections.len());
        sections.push(Section {
            name: sec_name,
            kind,
            align,
            data: content,
            size,
            relocations: Vec::new(),
        });
    }

    let mut symbols = Vec::new();
    for sym in obj.symbols() {
        if matches!(sym.kind(), SymbolKind::Section | SymbolKind::File) {
            continue;
        }
        let sym_name = sym
            .name()
            .map_err(|e| malformed(name, format!("bad symbol name: {e}")))?;
        if sym_name.is_empty() {
            continue;
        }
        let binding = if sym.is_weak() {
            Binding::Weak
        } else if sym.is_local() {
            Binding::Local
        } else {
            Binding::Global
        };
        let place = if sym.is_undefined() {
            SymbolPlace::Undefined
        } else if let Some(idx) = sym.section_index() {
            match index_map.get(&idx) {
                Some(&our) => {
                    let offset = sym.address();
                    if offset > sections[our].size {
                        return Err(malformed(
                            name,
                            format!(
                                "symbol {sym_name}: offset 0x{offset:x} outside section {}",
                                sections[our].name
                            ),
                        ));
                    }
                    SymbolPlace::Defined {
                        section: our,
                        offset,
                    }
                }
                None => {
                    tracing::debug!("{name}: skipping symbol {sym_name} in a skipped section");
                    continue;
                }
            }
        } else {
            tracing::debug!("{name}: skipping absolute symbol {sym_name}");
            continue;
        };
        symbols.push(Symbol {
            name: sym_name.to_string(),
            binding,
            place,
            size: sym.size(),
        });
    }

    for sec in obj.sections() {
        let Some(&our_idx) = index_map.get(&sec.index()) else {
            continue;
        };
        for (offset, reloc) in sec.relocations() {
            let kind = match (reloc.kind(), reloc.size()) {
                (RelocationKind::Absolute, 64) => RelocKind::Abs64,
                (RelocationKind::Absolute, 32) => RelocKind::Abs32,
                (RelocationKind::Relative, 32) | (RelocationKind::PltRelative, 32) => {
                    RelocKind::Rel32
                }
                (k, s) => {
                    return Err(malformed(
                        name,
                        format!(
                            "section {}: unsupported relocation {k:?} (width {s}) at offset 0x{offset:x}",
                            sections[our_idx].name
                        ),
                    ));
                }
            };
            let symbol = match reloc.target() {
                RelocationTarget::Symbol(idx) => {
                    let sym = obj
                        .symbol_by_index(idx)
                        .map_err(|e| malformed(name, format!("bad relocation symbol: {e}")))?;
                    if sym.kind() == SymbolKind::Section {
                        let sec_idx = sym.section_index().ok_or_else(|| {
                            malformed(name, "section symbol without a section")
                        })?;
                        section_anchor(name, &index_map, &sections, &mut symbols, sec_idx)?
                    } else {
                        let n = sym
                            .name()
                            .map_err(|e| malformed(name, format!("bad symbol name: {e}")))?;
                        if n.is_empty() {
                            return Err(malformed(name, "relocation against an unnamed symbol"));
                        }
                        n.to_string()
                    }
                }
                RelocationTarget::Section(sec_idx) => {
                    section_anchor(name, &index_map, &sections, &mut symbols, sec_idx)?
                }
                _ => return Err(malformed(name, "unsupported relocation target")),
            };

            if sections[our_idx].is_bss() {
                return Err(malformed(
                    name,
                    format!("relocation in BSS section {}", sections[our_idx].name),
                ));
            }
            if offset + kind.width() > sections[our_idx].size {
                return Err(malformed(
                    name,
                    format!(
                        "relocation at 0x{offset:x} overruns section {}",
                        sections[our_idx].name
                    ),
                ));
            }
            sections[our_idx].relocations.push(Relocation {
                offset,
                symbol,
                kind,
                addend: reloc.addend(),
            });
        }
    }

    Ok(ObjectFile::new(name.to_string(), sections, symbols))
}

/// Returns (synthesizing on first use) the local anchor symbol standing in
/// for a section-targeted relocation. The anchor sits at offset 0 of the
/// section and borrows its name.
fn section_anchor(
    name: &str,
    index_map: &HashMap<SectionIndex, usize>,
    sections: &[Section],
    symbols: &mut Vec<Symbol>,
    sec_idx: SectionIndex,
) -> LinkResult<String> {
    let &our = index_map
        .get(&sec_idx)
        .ok_or_else(|| malformed(name, "relocation against a skipped section"))?;
    let anchor = sections[our].name.clone();
    if !symbols.iter().any(|s| s.name == anchor) {
        symbols.push(Symbol {
            name: anchor.clone(),
            binding: Binding::Local,
            place: SymbolPlace::Defined {
                section: our,
                offset: 0,
            },
            size: 0,
        });
    }
    Ok(anchor)
}
