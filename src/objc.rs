//! Objective-C class/category reconstructor (component J): walks the
//! classref/classlist/catlist sections and rebuilds the class tree,
//! resolving super-class pointers either locally or, for classes defined in
//! another image, through the bind action collection.

use std::collections::{HashMap, VecDeque};

use crate::bind_collection::BindActionCollection;
use crate::devirt::DeVirtualizer;
use crate::error::ObjcError;
use crate::segment::Section;

const SYNTHETIC_ROOT_ADDR: u64 = u64::MAX;

const CLASS_REF_CANDIDATES: &[(&str, &str)] =
    &[("__OBJC2", "__class_refs"), ("__DATA", "__objc_classrefs")];
const CLASS_LIST_CANDIDATES: &[(&str, &str)] = &[
    ("__OBJC2", "__class_list"),
    ("__DATA_CONST", "__objc_classlist"),
    ("__DATA_DIRTY", "__objc_classlist"),
    ("__DATA", "__objc_classlist"),
];
const CAT_LIST_CANDIDATES: &[(&str, &str)] =
    &[("__DATA_CONST", "__objc_catlist"), ("__DATA", "__objc_catlist")];

/// A reconstructed Objective-C class, keyed into the tree by `address`.
///
/// Local classes key on their class-pointer VM address; external classes
/// (resolved through a bind) key on the address of the first bind slot that
/// referenced them, deduplicated by `(name, dylib_ordinal)` so every class
/// inheriting from the same external superclass shares one node.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub address: u64,
    pub bind_address: Option<u64>,
    pub dylib_ordinal: i64,
    pub flags: u32,
    pub is_external: bool,
    pub is_null: bool,
    pub is_swift: bool,
    pub category_list: Vec<u64>,
}

impl ClassInfo {
    fn null(address: u64) -> Self {
        ClassInfo {
            name: String::new(),
            address,
            bind_address: None,
            dylib_ordinal: 0,
            flags: 0,
            is_external: false,
            is_null: true,
            is_swift: false,
            category_list: Vec::new(),
        }
    }

    fn synthetic() -> Self {
        ClassInfo {
            name: String::new(),
            address: SYNTHETIC_ROOT_ADDR,
            bind_address: None,
            dylib_ordinal: 0,
            flags: 0,
            is_external: false,
            is_null: false,
            is_swift: false,
            category_list: Vec::new(),
        }
    }
}

/// A reconstructed category, weakly referencing the class it extends.
#[derive(Debug, Clone)]
pub struct CategoryInfo {
    pub name: String,
    pub class: Option<u64>,
    pub address: u64,
    pub is_null: bool,
}

#[derive(Debug)]
struct ClassNode {
    info: ClassInfo,
    parent: Option<u64>,
    first_child: Option<u64>,
    next_sibling: Option<u64>,
    last_child: Option<u64>,
    /// `raw_super_address | 1` until super-class resolution clears it.
    pending_super: Option<u64>,
}

/// The reconstructed forest: every node reachable by following `parent`
/// eventually reaches `root()` (synthetic when more than one root class
/// exists), and every node's children are reachable via
/// `first_child`/`next_sibling`.
#[derive(Debug)]
pub struct ObjcClassTree {
    nodes: HashMap<u64, ClassNode>,
    categories: HashMap<u64, CategoryInfo>,
    root: u64,
}

/// Iterates a node's children in attach order via the sibling chain.
pub struct Children<'a> {
    tree: &'a ObjcClassTree,
    next: Option<u64>,
}

impl Iterator for Children<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let cur = self.next?;
        self.next = self.tree.nodes.get(&cur).and_then(|n| n.next_sibling);
        Some(cur)
    }
}

impl ObjcClassTree {
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn class(&self, addr: u64) -> Option<&ClassInfo> {
        self.nodes.get(&addr).map(|n| &n.info)
    }

    pub fn parent(&self, addr: u64) -> Option<u64> {
        self.nodes.get(&addr).and_then(|n| n.parent)
    }

    pub fn children(&self, addr: u64) -> Children<'_> {
        Children {
            tree: self,
            next: self.nodes.get(&addr).and_then(|n| n.first_child),
        }
    }

    pub fn category(&self, addr: u64) -> Option<&CategoryInfo> {
        self.categories.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Default)]
struct Arena {
    nodes: HashMap<u64, ClassNode>,
    categories: HashMap<u64, CategoryInfo>,
    external_index: HashMap<(String, i64), u64>,
}

impl Arena {
    /// Inserts a freshly-parsed local class if `addr` isn't already known.
    /// Returns `true` if this was a new node (so the caller can schedule
    /// super-class resolution for it).
    fn ensure_class<F>(&mut self, addr: u64, parse: F) -> bool
    where
        F: FnOnce(u64) -> Result<(ClassInfo, u64), ObjcError>,
    {
        if self.nodes.contains_key(&addr) {
            return false;
        }
        let node = match parse(addr) {
            Ok((info, super_raw)) => ClassNode {
                info,
                parent: None,
                first_child: None,
                next_sibling: None,
                last_child: None,
                pending_super: (super_raw != 0).then_some(super_raw | 1),
            },
            Err(e) => {
                log::warn!("failed to parse objc class at 0x{addr:x}: {e}");
                ClassNode {
                    info: ClassInfo::null(addr),
                    parent: None,
                    first_child: None,
                    next_sibling: None,
                    last_child: None,
                    pending_super: None,
                }
            }
        };
        self.nodes.insert(addr, node);
        true
    }

    fn null_class(&mut self, addr: u64) {
        self.nodes.entry(addr).or_insert_with(|| ClassNode {
            info: ClassInfo::null(addr),
            parent: None,
            first_child: None,
            next_sibling: None,
            last_child: None,
            pending_super: None,
        });
    }

    /// Finds or creates the external class node for `(name, ordinal)`,
    /// keyed on `first_addr` the first time it's seen.
    fn external_for(&mut self, name: String, ordinal: i64, first_addr: u64) -> u64 {
        if let Some(&addr) = self.external_index.get(&(name.clone(), ordinal)) {
            return addr;
        }
        self.external_index.insert((name.clone(), ordinal), first_addr);
        self.nodes.insert(
            first_addr,
            ClassNode {
                info: ClassInfo {
                    name,
                    address: first_addr,
                    bind_address: Some(first_addr),
                    dylib_ordinal: ordinal,
                    flags: 0,
                    is_external: true,
                    is_null: false,
                    is_swift: false,
                    category_list: Vec::new(),
                },
                parent: None,
                first_child: None,
                next_sibling: None,
                last_child: None,
                pending_super: None,
            },
        );
        first_addr
    }

    fn set_parent(&mut self, child: u64, parent: Option<u64>) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = parent;
            node.pending_super = None;
        }
        if let Some(p) = parent {
            self.append_child(p, child);
        }
    }

    fn append_child(&mut self, parent: u64, child: u64) {
        let last = self.nodes.get(&parent).and_then(|n| n.last_child);
        match last {
            Some(last_addr) => {
                if let Some(n) = self.nodes.get_mut(&last_addr) {
                    n.next_sibling = Some(child);
                }
            }
            None => {
                if let Some(n) = self.nodes.get_mut(&parent) {
                    n.first_child = Some(child);
                }
            }
        }
        if let Some(n) = self.nodes.get_mut(&parent) {
            n.last_child = Some(child);
        }
    }

    fn attach_category(&mut self, class_addr: u64, cat_addr: u64) {
        if let Some(n) = self.nodes.get_mut(&class_addr) {
            n.info.category_list.push(cat_addr);
        }
    }

    /// Roots are every node still parentless once resolution drains: real
    /// root classes (`super == 0`), external classes, and null classes.
    /// A single root becomes the tree root; more than one get a synthetic
    /// parent (spec's "synthetic null root").
    fn finalize(mut self) -> ObjcClassTree {
        let mut roots: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(&a, _)| a)
            .collect();
        roots.sort_unstable();

        let root = if roots.len() == 1 {
            roots[0]
        } else {
            self.nodes.insert(
                SYNTHETIC_ROOT_ADDR,
                ClassNode {
                    info: ClassInfo::synthetic(),
                    parent: None,
                    first_child: None,
                    next_sibling: None,
                    last_child: None,
                    pending_super: None,
                },
            );
            for r in roots {
                self.set_parent(r, Some(SYNTHETIC_ROOT_ADDR));
            }
            SYNTHETIC_ROOT_ADDR
        };

        ObjcClassTree {
            nodes: self.nodes,
            categories: self.categories,
            root,
        }
    }
}

fn strip_class_symbol_prefix(symbol: &str) -> String {
    symbol.strip_prefix("_OBJC_CLASS_$_").unwrap_or(symbol).to_string()
}

/// Walks the class-pointer/category sections of one image and produces an
/// [`ObjcClassTree`] (component J).
pub struct ObjcReconstructor<'a> {
    devirt: DeVirtualizer<'a>,
    binds: &'a BindActionCollection,
}

impl<'a> ObjcReconstructor<'a> {
    pub fn new(devirt: DeVirtualizer<'a>, binds: &'a BindActionCollection) -> Self {
        ObjcReconstructor { devirt, binds }
    }

    fn find_section(&self, candidates: &[(&str, &str)]) -> Option<Section> {
        candidates
            .iter()
            .find_map(|(seg, sect)| self.devirt.segments().section_named(seg, sect))
            .cloned()
    }

    fn pointer_slots(section: &Section) -> Result<Vec<u64>, ObjcError> {
        let size = section.vm_range.end - section.vm_range.start;
        if size % 8 != 0 {
            return Err(ObjcError::UnalignedSection);
        }
        let count = size / 8;
        Ok((0..count).map(|i| section.vm_range.start + i * 8).collect())
    }

    /// `Class { isa, super, cache, vtable, data }`, 64-bit layout.
    fn parse_class(&self, addr: u64) -> Result<(ClassInfo, u64), ObjcError> {
        let super_raw = self
            .devirt
            .u64_at(addr + 8)
            .ok_or(ObjcError::DataOutOfBounds(addr + 8))?;
        let data = self
            .devirt
            .u64_at(addr + 32)
            .ok_or(ObjcError::DataOutOfBounds(addr + 32))?;
        let is_swift = data & 0x3 != 0;
        let ro_addr = data & !0x3u64;
        let (flags, name) = self.parse_class_ro(ro_addr)?;
        let info = ClassInfo {
            name,
            address: addr,
            bind_address: None,
            dylib_ordinal: 0,
            flags,
            is_external: false,
            is_null: false,
            is_swift,
            category_list: Vec::new(),
        };
        Ok((info, super_raw))
    }

    /// `ClassRo { flags, instance_start, instance_size, reserved, ivar_layout,
    /// name, methods, protocols, ivars, weak_ivar_layout, properties }`.
    /// Only `flags` and `name` feed the class tree.
    fn parse_class_ro(&self, ro_addr: u64) -> Result<(u32, String), ObjcError> {
        let flags = self
            .devirt
            .u32_at(ro_addr)
            .ok_or(ObjcError::DataOutOfBounds(ro_addr))?;
        let name_vm = self
            .devirt
            .u64_at(ro_addr + 24)
            .ok_or(ObjcError::DataOutOfBounds(ro_addr + 24))?;
        let name = self
            .devirt
            .string_at(name_vm)
            .ok_or(ObjcError::InvalidAddress(name_vm))?
            .to_string();
        Ok((flags, name))
    }

    /// Resolves one classref/classlist slot: a bind hit produces (or
    /// locates) an external class; otherwise the slot's pointer value is
    /// parsed as a local class. Unreadable or null slots become a null
    /// class node rather than aborting the walk.
    fn resolve_class_slot(&self, slot_addr: u64, arena: &mut Arena, queue: &mut VecDeque<u64>) {
        if let Some(bind) = self.binds.info_for_address(slot_addr) {
            let name = strip_class_symbol_prefix(&bind.symbol);
            arena.external_for(name, bind.dylib_ordinal, slot_addr);
            return;
        }
        match self.devirt.u64_at(slot_addr) {
            Some(v) if v != 0 => {
                if arena.ensure_class(v, |a| self.parse_class(a)) {
                    queue.push_back(v);
                }
            }
            _ => arena.null_class(slot_addr),
        }
    }

    /// Resolves one pending `super` pointer: a bind hit at the `super`
    /// field's own slot yields an external parent; a zero raw address is a
    /// root; an already-known address is adopted; otherwise the class at
    /// that address is parsed and linked (the "already known" check is the
    /// cycle guard).
    fn resolve_super(&self, addr: u64, arena: &mut Arena, queue: &mut VecDeque<u64>) {
        let pending = match arena.nodes.get(&addr) {
            Some(n) => n.pending_super,
            None => return,
        };
        let Some(sentineled) = pending else { return };
        let raw = sentineled & !1;
        let super_slot = addr + 8;

        if let Some(bind) = self.binds.info_for_address(super_slot) {
            let name = strip_class_symbol_prefix(&bind.symbol);
            let parent = arena.external_for(name, bind.dylib_ordinal, super_slot);
            arena.set_parent(addr, Some(parent));
            return;
        }

        if raw == 0 {
            arena.set_parent(addr, None);
            return;
        }

        if arena.nodes.contains_key(&raw) {
            arena.set_parent(addr, Some(raw));
            return;
        }

        match self.parse_class(raw) {
            Ok((info, super_raw)) => {
                arena.nodes.insert(
                    raw,
                    ClassNode {
                        info,
                        parent: None,
                        first_child: None,
                        next_sibling: None,
                        last_child: None,
                        pending_super: (super_raw != 0).then_some(super_raw | 1),
                    },
                );
                arena.set_parent(addr, Some(raw));
                queue.push_back(raw);
            }
            Err(e) => {
                log::warn!("failed to parse objc superclass at 0x{raw:x}: {e}");
                arena.null_class(raw);
                arena.set_parent(addr, Some(raw));
            }
        }
    }

    /// `Category { name, class, instance_methods, class_methods, protocols,
    /// instance_properties, v7, v8 }`; only `name` and `class` feed
    /// `CategoryInfo`.
    fn parse_category(
        &self,
        addr: u64,
        arena: &mut Arena,
        queue: &mut VecDeque<u64>,
    ) -> Result<CategoryInfo, ObjcError> {
        let name_vm = self
            .devirt
            .u64_at(addr)
            .ok_or(ObjcError::DataOutOfBounds(addr))?;
        let name = self
            .devirt
            .string_at(name_vm)
            .ok_or(ObjcError::InvalidAddress(name_vm))?
            .to_string();

        let class_slot = addr + 8;
        let class_addr = if let Some(bind) = self.binds.info_for_address(class_slot) {
            let cname = strip_class_symbol_prefix(&bind.symbol);
            Some(arena.external_for(cname, bind.dylib_ordinal, class_slot))
        } else {
            match self.devirt.u64_at(class_slot) {
                Some(v) if v != 0 => {
                    if arena.ensure_class(v, |a| self.parse_class(a)) {
                        queue.push_back(v);
                    }
                    Some(v)
                }
                _ => None,
            }
        };

        Ok(CategoryInfo {
            name,
            class: class_addr,
            address: addr,
            is_null: class_addr.is_none(),
        })
    }

    fn parse_categories(
        &self,
        section: &Section,
        arena: &mut Arena,
        queue: &mut VecDeque<u64>,
    ) -> Result<(), ObjcError> {
        for slot in Self::pointer_slots(section)? {
            let cat_addr = match self.devirt.u64_at(slot) {
                Some(v) if v != 0 => v,
                _ => continue,
            };
            match self.parse_category(cat_addr, arena, queue) {
                Ok(cat) => {
                    if let Some(class_addr) = cat.class {
                        arena.attach_category(class_addr, cat_addr);
                    }
                    arena.categories.insert(cat_addr, cat);
                }
                Err(e) => log::warn!("failed to parse objc category at 0x{cat_addr:x}: {e}"),
            }
        }
        Ok(())
    }

    /// Runs the whole walk: locate sections, parse class slots, resolve
    /// super-class chains, parse categories, finalize the tree.
    pub fn build(&self) -> Result<ObjcClassTree, ObjcError> {
        let class_section = self
            .find_section(CLASS_REF_CANDIDATES)
            .or_else(|| self.find_section(CLASS_LIST_CANDIDATES));
        let cat_section = self.find_section(CAT_LIST_CANDIDATES);

        if class_section.is_none() && cat_section.is_none() {
            return Err(ObjcError::NoObjcData);
        }

        let mut arena = Arena::default();
        let mut queue: VecDeque<u64> = VecDeque::new();

        if let Some(section) = &class_section {
            for slot in Self::pointer_slots(section)? {
                self.resolve_class_slot(slot, &mut arena, &mut queue);
            }
        }
        while let Some(addr) = queue.pop_front() {
            self.resolve_super(addr, &mut arena, &mut queue);
        }

        if let Some(section) = &cat_section {
            self.parse_categories(section, &mut arena, &mut queue)?;
            while let Some(addr) = queue.pop_front() {
                self.resolve_super(addr, &mut arena, &mut queue);
            }
        }

        Ok(arena.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::{BindActionIterator, BindKind};
    use crate::config::BindVmConfig;
    use crate::opcode::OpcodeByte;
    use crate::segment::{Protection, SGFlags, Section, SectionAttributes, SectionType, Segment};
    use crate::segment::SegmentIndex;

    fn write_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn write_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn write_cstr(buf: &mut [u8], off: usize, s: &str) {
        buf[off..off + s.len()].copy_from_slice(s.as_bytes());
        buf[off + s.len()] = 0;
    }

    const SEG_VM_BASE: u64 = 0x4000;

    /// Writes one `Class`+`ClassRo`+name triple at `class_off`/`ro_off`,
    /// returning the class's VM address.
    fn write_class(image: &mut [u8], class_off: u64, ro_off: u64, super_raw: u64, name: &str) -> u64 {
        let class_addr = SEG_VM_BASE + class_off;
        let ro_addr = SEG_VM_BASE + ro_off;
        write_u64(image, class_off as usize + 8, super_raw);
        write_u64(image, class_off as usize + 32, ro_addr);

        write_u32(image, ro_off as usize, 0); // flags
        let name_addr = ro_addr + 0x40;
        write_u64(image, ro_off as usize + 24, name_addr);
        write_cstr(image, (ro_off + 0x40) as usize, name);
        class_addr
    }

    fn section(segname: &str, sectname: &str, vm: std::ops::Range<u64>) -> Section {
        let file = (vm.start - SEG_VM_BASE)..(vm.end - SEG_VM_BASE);
        Section {
            sectname: sectname.into(),
            segname: segname.into(),
            vm_range: vm,
            file_range: file,
            flags_sectype: SectionType::SRegular,
            flags_secattrs: SectionAttributes::empty(),
        }
    }

    fn segment_with_sections(sections: Vec<Section>, segname: &str) -> Segment {
        Segment {
            segname: segname.into(),
            vm_range: SEG_VM_BASE..SEG_VM_BASE + 0x400,
            file_range: 0..0x400,
            maxprot: Protection::READ | Protection::WRITE,
            initprot: Protection::READ | Protection::WRITE,
            flags: SGFlags::empty(),
            sections,
        }
    }

    #[test]
    fn single_local_root_class_is_tree_root() {
        let mut image = vec![0u8; 0x400];
        let class_addr = write_class(&mut image, 0x00, 0x40, 0, "Foo");

        let classlist_off: u64 = 0x200;
        write_u64(&mut image, classlist_off as usize, class_addr);
        let classlist_section = section(
            "__DATA_CONST",
            "__objc_classlist",
            SEG_VM_BASE + classlist_off..SEG_VM_BASE + classlist_off + 8,
        );
        let seg = segment_with_sections(vec![classlist_section], "__DATA_CONST");
        let segs = SegmentIndex::new(vec![seg]);
        let devirt = DeVirtualizer::new(&image, &segs);
        let binds = BindActionCollection::new();

        let tree = ObjcReconstructor::new(devirt, &binds).build().unwrap();
        assert_eq!(tree.root(), class_addr);
        assert_eq!(tree.class(class_addr).unwrap().name, "Foo");
        assert!(tree.parent(class_addr).is_none());
    }

    #[test]
    fn two_root_classes_get_synthetic_root() {
        let mut image = vec![0u8; 0x400];
        let foo_addr = write_class(&mut image, 0x00, 0x40, 0, "Foo");
        let bar_addr = write_class(&mut image, 0x80, 0xc0, 0, "Bar");

        let classlist_off: u64 = 0x200;
        write_u64(&mut image, classlist_off as usize, foo_addr);
        write_u64(&mut image, classlist_off as usize + 8, bar_addr);
        let classlist_section = section(
            "__DATA_CONST",
            "__objc_classlist",
            SEG_VM_BASE + classlist_off..SEG_VM_BASE + classlist_off + 16,
        );
        let seg = segment_with_sections(vec![classlist_section], "__DATA_CONST");
        let segs = SegmentIndex::new(vec![seg]);
        let devirt = DeVirtualizer::new(&image, &segs);
        let binds = BindActionCollection::new();

        let tree = ObjcReconstructor::new(devirt, &binds).build().unwrap();
        assert_eq!(tree.root(), SYNTHETIC_ROOT_ADDR);
        let children: Vec<u64> = tree.children(tree.root()).collect();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&foo_addr));
        assert!(children.contains(&bar_addr));
    }

    #[test]
    fn super_resolved_via_bind_collection() {
        let mut image = vec![0u8; 0x400];
        // super field is not yet meaningful on disk; the bind hit takes
        // priority over whatever raw value sits there.
        let class_addr = write_class(&mut image, 0x00, 0x40, 0xdead, "Foo");

        let classlist_off: u64 = 0x200;
        write_u64(&mut image, classlist_off as usize, class_addr);
        let classlist_section = section(
            "__DATA_CONST",
            "__objc_classlist",
            SEG_VM_BASE + classlist_off..SEG_VM_BASE + classlist_off + 8,
        );
        let seg = segment_with_sections(vec![classlist_section], "__DATA_CONST");
        let segs = SegmentIndex::new(vec![seg]);

        // Bind action at the super field's own VM address (class_addr + 8).
        let super_off_in_seg = class_addr + 8 - SEG_VM_BASE;
        let mut bind_bytes = vec![
            OpcodeByte::pack(0x10, 1), // SetDylibOrdinalImm(1)
            OpcodeByte::pack(0x40, 0), // SetSymbolTrailingFlagsImm
        ];
        bind_bytes.extend_from_slice(b"_OBJC_CLASS_$_NSObject\0");
        bind_bytes.push(OpcodeByte::pack(0x50, 0)); // SetKindImm(Pointer)
        bind_bytes.push(OpcodeByte::pack(0x70, 0)); // SetSegmentAndOffsetUleb(seg 0, ...)
        bind_bytes.push(super_off_in_seg as u8);
        bind_bytes.push(OpcodeByte::pack(0x90, 0)); // DoBind
        bind_bytes.push(OpcodeByte::pack(0x00, 0)); // Done

        let mut binds = BindActionCollection::new();
        binds
            .fold(
                BindActionIterator::new(
                    &bind_bytes,
                    BindKind::Normal,
                    &segs,
                    &image,
                    BindVmConfig::default(),
                ),
                &segs,
            )
            .unwrap();

        let devirt = DeVirtualizer::new(&image, &segs);
        let tree = ObjcReconstructor::new(devirt, &binds).build().unwrap();

        let parent_addr = tree.parent(class_addr).unwrap();
        let parent = tree.class(parent_addr).unwrap();
        assert_eq!(parent.name, "NSObject");
        assert_eq!(parent.dylib_ordinal, 1);
        assert!(parent.is_external);
    }

    #[test]
    fn category_attaches_to_local_class() {
        let mut image = vec![0u8; 0x400];
        let class_addr = write_class(&mut image, 0x00, 0x40, 0, "Foo");

        let classlist_off: u64 = 0x200;
        write_u64(&mut image, classlist_off as usize, class_addr);
        let classlist_section = section(
            "__DATA_CONST",
            "__objc_classlist",
            SEG_VM_BASE + classlist_off..SEG_VM_BASE + classlist_off + 8,
        );

        let cat_struct_off: usize = 0x280;
        let cat_name_off: usize = 0x2c0;
        write_u64(&mut image, cat_struct_off, SEG_VM_BASE + cat_name_off as u64);
        write_cstr(&mut image, cat_name_off, "FooAdditions");
        write_u64(&mut image, cat_struct_off + 8, class_addr);

        let catlist_off: u64 = 0x300;
        write_u64(&mut image, catlist_off as usize, SEG_VM_BASE + cat_struct_off as u64);
        let catlist_section = section(
            "__DATA_CONST",
            "__objc_catlist",
            SEG_VM_BASE + catlist_off..SEG_VM_BASE + catlist_off + 8,
        );

        let seg = segment_with_sections(vec![classlist_section, catlist_section], "__DATA_CONST");
        let segs = SegmentIndex::new(vec![seg]);
        let devirt = DeVirtualizer::new(&image, &segs);
        let binds = BindActionCollection::new();

        let tree = ObjcReconstructor::new(devirt, &binds).build().unwrap();
        let cat_addr = SEG_VM_BASE + cat_struct_off as u64;
        let cat = tree.category(cat_addr).unwrap();
        assert_eq!(cat.name, "FooAdditions");
        assert_eq!(cat.class, Some(class_addr));
        assert!(!cat.is_null);
        assert_eq!(tree.class(class_addr).unwrap().category_list, vec![cat_addr]);
    }
}
