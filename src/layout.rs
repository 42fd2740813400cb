//! Output memory layout.
//!
//! The planner partitions every input section into one of four output
//! segments, in fixed order: `.text`, `.rodata`, `.data`, `.bss`. Within a
//! segment, sections keep the order their objects were supplied in, so
//! re-linking identical inputs produces identical layout. `.bss` reserves
//! address space but contributes no bytes to the image.

use std::collections::HashMap;

use crate::error::{LinkError, LinkResult};
use crate::object_file::{ObjectFile, SectionKind};
use crate::utils::align_up;

pub const PAGE_SIZE: u64 = 0x1000;

/// An input section placed inside a segment.
#[derive(Debug)]
pub struct PlacedSection {
    /// Index of the owning object in the input order.
    pub object: usize,
    /// Section index within that object.
    pub section: usize,
    /// Start offset within the segment.
    pub offset: u64,
}

/// A contiguous region of the output image holding all sections of one kind.
#[derive(Debug)]
pub struct Segment {
    pub name: &'static str,
    pub kind: SectionKind,
    pub sections: Vec<PlacedSection>,
    pub size: u64,
    /// Virtual address the segment loads at. Zero for empty segments.
    pub virtual_address: u64,
    /// File offset of the segment's bytes within the emitted image.
    pub file_offset: u64,
    /// Relocated segment content. Alignment padding stays zero-filled;
    /// always empty for `.bss`.
    pub data: Vec<u8>,
}

impl Segment {
    fn new(name: &'static str, kind: SectionKind) -> Self {
        Self {
            name,
            kind,
            sections: Vec::new(),
            size: 0,
            virtual_address: 0,
            file_offset: 0,
            data: Vec::new(),
        }
    }

    pub fn is_bss(&self) -> bool {
        self.kind == SectionKind::Bss
    }
}

/// Every section's final address, plus the segments that will become the
/// image. Built once per link, after resolution and before relocation.
#[derive(Debug)]
pub struct LayoutPlan {
    pub segments: Vec<Segment>,
    pub base_address: u64,
    section_map: HashMap<(usize, usize), (usize, u64)>,
}

impl LayoutPlan {
    /// Assigns a deterministic, non-overlapping address to every section of
    /// every input object.
    ///
    /// Segment virtual addresses are page-aligned, starting one page past
    /// `base_address` to leave room for the image headers; file offsets
    /// mirror virtual addresses. Fails with [`LinkError::LayoutOverflow`] if
    /// the total span (including `.bss`) would exceed `max_image_size`.
    pub fn compute(
        objects: &[ObjectFile],
        base_address: u64,
        max_image_size: u64,
    ) -> LinkResult<Self> {
        let mut segments = vec![
            Segment::new(".text", SectionKind::Code),
            Segment::new(".rodata", SectionKind::Rodata),
            Segment::new(".data", SectionKind::Data),
            Segment::new(".bss", SectionKind::Bss),
        ];
        let mut section_map = HashMap::new();

        for (obj_index, obj) in objects.iter().enumerate() {
            for (sec_index, sec) in obj.sections.iter().enumerate() {
                let seg_index = match sec.kind {
                    SectionKind::Code => 0,
                    SectionKind::Rodata => 1,
                    SectionKind::Data => 2,
                    SectionKind::Bss => 3,
                };
                let segment = &mut segments[seg_index];
                let start = align_up(segment.size, sec.align);
                segment.size = start + sec.size;
                if !segment.is_bss() {
                    // Alignment gap bytes are zero: inert filler, never code.
                    segment.data.resize(start as usize, 0);
                    segment.data.extend_from_slice(&sec.data);
                }
                segment.sections.push(PlacedSection {
                    object: obj_index,
                    section: sec_index,
                    offset: start,
                });
                section_map.insert((obj_index, sec_index), (seg_index, start));
                tracing::trace!(
                    "placed {}:{} at {}+0x{start:x}",
                    obj.name,
                    sec.name,
                    segment.name
                );
            }
        }

        let mut current_va = base_address + PAGE_SIZE;
        let mut current_off = PAGE_SIZE;
        for segment in &mut segments {
            if segment.size == 0 {
                continue;
            }
            current_va = align_up(current_va, PAGE_SIZE);
            current_off = align_up(current_off, PAGE_SIZE);
            segment.virtual_address = current_va;
            segment.file_offset = current_off;
            current_va += segment.size;
            if !segment.is_bss() {
                current_off += segment.size;
            }
        }

        let needed = current_va - base_address;
        if needed > max_image_size {
            return Err(LinkError::LayoutOverflow {
                needed,
                max: max_image_size,
            });
        }

        Ok(Self {
            segments,
            base_address,
            section_map,
        })
    }

    /// Segment index and segment-relative offset of a placed section.
    pub fn placement(&self, object: usize, section: usize) -> Option<(usize, u64)> {
        self.section_map.get(&(object, section)).copied()
    }

    /// Final virtual address of a section's first byte.
    pub fn section_address(&self, object: usize, section: usize) -> Option<u64> {
        let (seg, offset) = self.placement(object, section)?;
        Some(self.segments[seg].virtual_address + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_file::Section;

    fn section(name: &str, kind: SectionKind, align: u64, size: u64) -> Section {
        let data = if kind == SectionKind::Bss {
            Vec::new()
        } else {
            vec![0xABu8; size as usize]
        };
        Section {
            name: name.to_string(),
            kind,
            align,
            data,
            size,
            relocations: Vec::new(),
        }
    }

    fn obj(name: &str, sections: Vec<Section>) -> ObjectFile {
        ObjectFile::new(name.to_string(), sections, Vec::new())
    }

    const BASE: u64 = 0x400000;
    const MAX: u64 = 0x1000_0000;

    #[test]
    fn segments_are_ordered_and_page_aligned() {
        let objects = vec![
            obj(
                "a.o",
                vec![
                    section(".text", SectionKind::Code, 16, 100),
                    section(".data", SectionKind::Data, 8, 40),
                ],
            ),
            obj("b.o", vec![section(".bss", SectionKind::Bss, 32, 200)]),
        ];
        let plan = LayoutPlan::compute(&objects, BASE, MAX).unwrap();

        let text = &plan.segments[0];
        let data = &plan.segments[2];
        let bss = &plan.segments[3];
        assert_eq!(text.virtual_address, BASE + PAGE_SIZE);
        assert!(data.virtual_address >= text.virtual_address + text.size);
        assert!(bss.virtual_address >= data.virtual_address + data.size);
        assert_eq!(text.virtual_address % PAGE_SIZE, 0);
        assert_eq!(data.virtual_address % PAGE_SIZE, 0);
        assert_eq!(bss.virtual_address % PAGE_SIZE, 0);
    }

    #[test]
    fn sections_keep_input_order_and_alignment() {
        let objects = vec![
            obj("a.o", vec![section(".text", SectionKind::Code, 4, 10)]),
            obj("b.o", vec![section(".text", SectionKind::Code, 16, 6)]),
        ];
        let plan = LayoutPlan::compute(&objects, BASE, MAX).unwrap();
        let (seg_a, off_a) = plan.placement(0, 0).unwrap();
        let (seg_b, off_b) = plan.placement(1, 0).unwrap();
        assert_eq!(seg_a, seg_b);
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 16);
        // The alignment gap is zero-filled.
        assert_eq!(&plan.segments[seg_a].data[10..16], &[0u8; 6]);
        assert_eq!(plan.segments[seg_a].size, 22);
    }

    #[test]
    fn bss_reserves_space_without_bytes() {
        let objects = vec![obj(
            "a.o",
            vec![
                section(".text", SectionKind::Code, 16, 8),
                section(".bss", SectionKind::Bss, 8, 0x5000),
            ],
        )];
        let plan = LayoutPlan::compute(&objects, BASE, MAX).unwrap();
        let bss = &plan.segments[3];
        assert_eq!(bss.size, 0x5000);
        assert!(bss.data.is_empty());
        assert!(bss.virtual_address > 0);
    }

    #[test]
    fn overflow_is_reported() {
        let objects = vec![obj(
            "a.o",
            vec![section(".text", SectionKind::Code, 16, 0x4000)],
        )];
        let err = LayoutPlan::compute(&objects, BASE, 0x2000).unwrap_err();
        match err {
            LinkError::LayoutOverflow { needed, max } => {
                assert!(needed > max);
                assert_eq!(max, 0x2000);
            }
            other => panic!("expected LayoutOverflow, got {other}"),
        }
    }

    #[test]
    fn identical_inputs_produce_identical_layout() {
        let make = || {
            vec![
                obj(
                    "a.o",
                    vec![
                        section(".text", SectionKind::Code, 16, 33),
                        section(".rodata", SectionKind::Rodata, 8, 17),
                    ],
                ),
                obj("b.o", vec![section(".data", SectionKind::Data, 4, 9)]),
            ]
        };
        let p1 = LayoutPlan::compute(&make(), BASE, MAX).unwrap();
        let p2 = LayoutPlan::compute(&make(), BASE, MAX).unwrap();
        for (s1, s2) in p1.segments.iter().zip(p2.segments.iter()) {
            assert_eq!(s1.virtual_address, s2.virtual_address);
            assert_eq!(s1.file_offset, s2.file_offset);
            assert_eq!(s1.data, s2.data);
        }
    }
}
