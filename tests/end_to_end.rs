//! Exercises the full data flow from a raw byte image through the thin
//! Mach-O front end into every core engine: `MachOImage::parse` locates the
//! segment table and the `LC_DYLD_INFO` byte ranges, a normal bind stream
//! folds into a `BindActionCollection`, an export trie yields its entries,
//! and the Objective-C reconstructor walks a class list into a tree.

use machobind::bind::{BindActionIterator, BindKind};
use machobind::bind_collection::BindActionCollection;
use machobind::config::{BindVmConfig, ExportTrieConfig};
use machobind::devirt::DeVirtualizer;
use machobind::export_trie::{ExportKind, ExportTrieIterator};
use machobind::macho::MachOImage;
use machobind::objc::ObjcReconstructor;

const VM_BASE: u64 = 0x4000;

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_segname(buf: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&field);
}

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

fn uleb(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
    out
}

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

/// Builds `root_prefix ++ uleb(child_offset) ++ child_node`, solving for the
/// self-referential `child_offset` by fixed-point iteration (see
/// `export_trie.rs`'s own test helper of the same name).
fn node_with_one_child(root_prefix: &[u8], child_node: &[u8]) -> Vec<u8> {
    let mut offset_guess = root_prefix.len() + 1;
    loop {
        let enc = uleb(offset_guess as u64);
        let total_prefix = root_prefix.len() + enc.len();
        if total_prefix == offset_guess {
            let mut bytes = root_prefix.to_vec();
            bytes.extend(enc);
            bytes.extend(child_node);
            return bytes;
        }
        offset_guess = total_prefix;
    }
}

fn build_export_trie_bytes() -> Vec<u8> {
    let mut terminal = uleb(0); // flags: regular export
    terminal.extend(uleb(0x100)); // image_offset
    let mut foo_node = uleb(terminal.len() as u64);
    foo_node.extend(&terminal);
    foo_node.push(0); // no children

    let mut root_prefix = uleb(0); // no export at the root itself
    root_prefix.push(1); // one child edge
    root_prefix.extend(cstr("foo"));

    node_with_one_child(&root_prefix, &foo_node)
}

fn build_bind_bytes(seg_offset: u64) -> Vec<u8> {
    let mut bytes = vec![
        0x10 | 1, // SET_DYLIB_ORDINAL_IMM(1)
        0x50,     // SET_KIND_IMM(Pointer)
    ];
    bytes.push(0x40); // SET_SYMBOL_TRAILING_FLAGS_IMM(0)
    bytes.extend_from_slice(b"_shared_symbol\0");
    bytes.push(0x70); // SET_SEGMENT_AND_OFFSET_ULEB(segment 0, ...)
    bytes.extend(uleb(seg_offset));
    bytes.push(0x90); // DO_BIND
    bytes.push(0x00); // DONE
    bytes
}

/// Assembles a minimal single-architecture Mach-O image: header, one
/// `__DATA_CONST` segment spanning the whole file (so `vmaddr - fileoff`
/// stays a constant `VM_BASE`), an `__objc_classlist` section holding one
/// class pointer, a normal bind stream, and an export trie, all wired up
/// through `LC_DYLD_INFO_ONLY`.
fn build_image() -> Vec<u8> {
    const CLASS_OFF: usize = 0x200;
    const RO_OFF: usize = 0x240;
    const NAME_OFF: usize = 0x280;
    const CLASSLIST_OFF: usize = 0x300;
    const BIND_OFF: usize = 0x340;
    const EXPORT_OFF: usize = 0x380;
    const TOTAL: usize = 0x500;

    let mut image = Vec::new();
    push_u32(&mut image, 0xfeedfacf); // MH_MAGIC_64
    push_u32(&mut image, 0x0100000c); // CPU_TYPE_ARM64
    push_u32(&mut image, 0); // cpusubtype
    push_u32(&mut image, 0x2); // MH_EXECUTE
    push_u32(&mut image, 2); // ncmds
    let sizeofcmds_offset = image.len();
    push_u32(&mut image, 0); // sizeofcmds, patched below
    push_u32(&mut image, 0); // flags
    push_u32(&mut image, 0); // reserved

    let cmds_start = image.len();

    // LC_SEGMENT_64 "__DATA_CONST", one section, spanning the whole file.
    push_u32(&mut image, 0x19);
    push_u32(&mut image, 8 + 64 + 80); // cmdsize
    push_segname(&mut image, "__DATA_CONST");
    push_u64(&mut image, VM_BASE); // vmaddr
    push_u64(&mut image, TOTAL as u64); // vmsize
    push_u64(&mut image, 0); // fileoff
    push_u64(&mut image, TOTAL as u64); // filesize
    push_u32(&mut image, 0x3); // maxprot rw-
    push_u32(&mut image, 0x3); // initprot rw-
    push_u32(&mut image, 1); // nsects
    push_u32(&mut image, 0); // flags

    // section_64 "__objc_classlist"
    push_segname(&mut image, "__objc_classlist");
    push_segname(&mut image, "__DATA_CONST");
    push_u64(&mut image, VM_BASE + CLASSLIST_OFF as u64); // addr
    push_u64(&mut image, 8); // size: one class pointer
    push_u32(&mut image, CLASSLIST_OFF as u32); // offset
    push_u32(&mut image, 0); // align
    push_u32(&mut image, 0); // reloff
    push_u32(&mut image, 0); // nreloc
    push_u32(&mut image, 0); // flags (S_REGULAR, no attrs)
    push_u32(&mut image, 0); // reserved1
    push_u32(&mut image, 0); // reserved2
    push_u32(&mut image, 0); // reserved3

    // LC_DYLD_INFO_ONLY
    push_u32(&mut image, 0x80000022);
    push_u32(&mut image, 8 + 40); // cmdsize
    push_u32(&mut image, 0); // rebase_off
    push_u32(&mut image, 0); // rebase_size
    push_u32(&mut image, BIND_OFF as u32);
    let bind_bytes = build_bind_bytes(0x2F0);
    push_u32(&mut image, bind_bytes.len() as u32);
    push_u32(&mut image, 0); // weak_bind_off
    push_u32(&mut image, 0); // weak_bind_size
    push_u32(&mut image, 0); // lazy_bind_off
    push_u32(&mut image, 0); // lazy_bind_size
    push_u32(&mut image, EXPORT_OFF as u32);
    let export_bytes = build_export_trie_bytes();
    push_u32(&mut image, export_bytes.len() as u32);

    let sizeofcmds = (image.len() - cmds_start) as u32;
    image[sizeofcmds_offset..sizeofcmds_offset + 4].copy_from_slice(&sizeofcmds.to_le_bytes());

    image.resize(TOTAL, 0);

    // One root class "Widget": Class{isa,super=0,cache,vtable,data->ro}.
    write_u64(&mut image, CLASS_OFF + 8, 0); // super
    write_u64(&mut image, CLASS_OFF + 32, (VM_BASE as usize + RO_OFF) as u64); // data -> ro, no Swift bit
    write_u32(&mut image, RO_OFF, 0); // ro flags
    write_u64(&mut image, RO_OFF + 24, (VM_BASE as usize + NAME_OFF) as u64); // name pointer
    write_cstr(&mut image, NAME_OFF, "Widget");

    write_u64(&mut image, CLASSLIST_OFF, VM_BASE + CLASS_OFF as u64);

    image[BIND_OFF..BIND_OFF + bind_bytes.len()].copy_from_slice(&bind_bytes);
    image[EXPORT_OFF..EXPORT_OFF + export_bytes.len()].copy_from_slice(&export_bytes);

    image
}

#[test]
fn full_pipeline_from_raw_image_to_objc_tree() {
    let image = build_image();
    let parsed = MachOImage::parse(&image).expect("image parses");
    assert!(parsed.header.is_64());
    assert_eq!(parsed.segments.len(), 1);

    let dyld_info = parsed.dyld_info.expect("LC_DYLD_INFO_ONLY present");

    let bind_bytes = dyld_info.bind.bytes(&image).expect("bind range in bounds");
    let mut binds = BindActionCollection::new();
    binds
        .fold(
            BindActionIterator::new(
                bind_bytes,
                BindKind::Normal,
                &parsed.segments,
                &image,
                BindVmConfig::default(),
            ),
            &parsed.segments,
        )
        .expect("bind stream folds cleanly");
    let collected: Vec<_> = binds.iter().collect();
    assert_eq!(collected.len(), 1);
    let (&addr, bind) = collected[0];
    assert_eq!(addr, VM_BASE + 0x2F0);
    assert_eq!(&*bind.symbol, "_shared_symbol");
    assert_eq!(bind.dylib_ordinal, 1);

    let export_bytes = dyld_info.export.bytes(&image).expect("export range in bounds");
    let entries: Vec<_> = ExportTrieIterator::new(export_bytes, ExportTrieConfig::default())
        .collect::<Result<_, _>>()
        .expect("export trie walks cleanly");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].symbol, "foo");
    assert_eq!(entries[0].kind, ExportKind::Regular);
    assert_eq!(entries[0].image_offset, Some(0x100));

    let devirt = DeVirtualizer::new(&image, &parsed.segments);
    let tree = ObjcReconstructor::new(devirt, &binds)
        .build()
        .expect("objc tree reconstructs");
    assert_eq!(tree.class(tree.root()).unwrap().name, "Widget");
    assert!(tree.parent(tree.root()).is_none());
}
