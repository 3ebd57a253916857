//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;

use ukvdso_tool::builder::{build_image, build_image_file, load_symbols};
use ukvdso_tool::descriptor;
use ukvdso_tool::emit::{ImageOptions, DEFAULT_MAGIC};
use ukvdso_tool::memmap::{parse_memory_map, MapQuery};
use ukvdso_tool::rewrite::{rewrite_kernel, RewriteOptions};
use ukvdso_tool::symbols::{SymbolMap, SymbolMapping};
use ukvdso_tool::toolchain::{CompileDefines, VdsoCompiler};
use ukvdso_tool::{Category, Error, Result};

fn fixture(dir: &str, name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push(dir);
    path.push(name);
    path
}

fn check_error(test_name: &str, err: &str) {
    let path = fixture("descriptors", test_name);
    let xml = fs::read_to_string(path).unwrap();
    let parse_err = descriptor::parse(test_name, &xml).unwrap_err().to_string();
    assert!(
        parse_err.starts_with(err),
        "unexpected error '{parse_err}', expected it to start with '{err}'"
    );
}

fn check_missing(test_name: &str, attr: &str, element: &str) {
    let expected_error = format!(
        "Error: Missing required attribute '{}' on element '{}'",
        attr, element
    );
    check_error(test_name, expected_error.as_str());
}

fn symbol_map(names: &[&str]) -> SymbolMap {
    SymbolMap::new(
        names
            .iter()
            .map(|name| SymbolMapping {
                source_symbol: name.to_string(),
                exported_name: format!("{name}_addr"),
            })
            .collect(),
    )
}

fn marker(key: u32) -> [u8; 8] {
    let mut bytes = [0; 8];
    bytes[..4].copy_from_slice(&key.to_le_bytes());
    bytes[4..].copy_from_slice(&DEFAULT_MAGIC.to_le_bytes());
    bytes
}

fn filler(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8) & 0x7f).collect()
}

/// A fake vDSO holding one opening and one closing marker per key, in the
/// order given. Returns the blob and the bytes expected once the opening
/// markers are cut out.
fn fake_vdso(keys: &[u32]) -> (Vec<u8>, Vec<u8>) {
    let mut blob = Vec::new();
    let mut stripped = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let pad = filler(16 + 8 * i, i as u8);
        blob.extend_from_slice(&pad);
        stripped.extend_from_slice(&pad);

        blob.extend_from_slice(&marker(*key));

        let body = filler(24, 0x40);
        blob.extend_from_slice(&body);
        stripped.extend_from_slice(&body);

        blob.extend_from_slice(&marker(*key));
        stripped.extend_from_slice(&marker(*key));
    }
    let tail = filler(13, 0x20);
    blob.extend_from_slice(&tail);
    stripped.extend_from_slice(&tail);
    (blob, stripped)
}

/// Byte arrays and slot count read back out of generated C source.
fn parse_arrays(source: &str) -> (Vec<Vec<u8>>, usize) {
    let mut arrays = Vec::new();
    let mut slots = 0;
    let mut current: Option<Vec<u8>> = None;

    let initialiser = source
        .split_once("= {\n")
        .map(|(_, rest)| rest)
        .unwrap();
    for line in initialiser.lines() {
        if line == "};" {
            break;
        }
        if line == "    {" {
            current = Some(Vec::new());
        } else if line.starts_with("    }") {
            arrays.push(current.take().unwrap());
        } else if line == "        0," {
            slots += 1;
        } else if let Some(row) = line.strip_prefix("\t\t") {
            let bytes = current.as_mut().unwrap();
            for token in row.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let hex = token.strip_prefix("0x").unwrap();
                bytes.push(u8::from_str_radix(hex, 16).unwrap());
            }
        }
    }
    (arrays, slots)
}

fn pointer_fields(source: &str) -> Vec<String> {
    source
        .lines()
        .filter_map(|l| l.trim().strip_prefix("void * "))
        .map(|l| l.trim_end_matches(';').to_string())
        .collect()
}

fn constructor_assignments(source: &str) -> Vec<String> {
    source
        .lines()
        .filter(|l| l.contains(" = (void *)((char *)&"))
        .map(|l| l.trim().to_string())
        .collect()
}

#[cfg(test)]
mod bin2c {
    use super::*;

    fn check_partitions(keys: &[u32]) {
        let names = ["alpha", "bravo", "charlie", "delta", "echo"];
        let symbols = symbol_map(&names[..keys.len()]);
        let (blob, stripped) = fake_vdso(keys);

        let image = build_image(&blob, &symbols, &ImageOptions::default()).unwrap();
        let (arrays, slots) = parse_arrays(&image.source);

        assert_eq!(slots, keys.len());
        assert_eq!(arrays.len(), keys.len() + 1);
        assert_eq!(image.layout.slot_count(), keys.len());
        assert_eq!(image.marker_count, keys.len() * 2);
        assert_eq!(arrays.concat(), stripped);
        assert_eq!(image.layout.stripped_bytes(&blob), stripped);
    }

    #[test]
    fn test_single_slot() {
        check_partitions(&[7]);
    }

    #[test]
    fn test_two_slots() {
        check_partitions(&[1, 2]);
    }

    #[test]
    fn test_five_slots() {
        check_partitions(&[0x50, 0x10, 0x40, 0x20, 0x30]);
    }

    #[test]
    fn test_ordinals_follow_sort_key() {
        let symbols = symbol_map(&["alpha", "bravo"]);
        let (in_order, _) = fake_vdso(&[1, 2]);
        let (swapped, _) = fake_vdso(&[2, 1]);

        let a = build_image(&in_order, &symbols, &ImageOptions::default()).unwrap();
        let b = build_image(&swapped, &symbols, &ImageOptions::default()).unwrap();

        // Struct fields follow the physical order...
        assert_eq!(pointer_fields(&a.source), ["alpha_addr", "bravo_addr"]);
        assert_eq!(pointer_fields(&b.source), ["bravo_addr", "alpha_addr"]);

        // ...but the symbol bound to a key does not.
        assert_eq!(
            constructor_assignments(&a.source),
            constructor_assignments(&b.source)
        );
        let lowest_key = b.layout.slots_by_ordinal()[0];
        assert_eq!(lowest_key.key, 1);
        assert_eq!(lowest_key.source_symbol, "alpha");
    }

    #[test]
    fn test_count_mismatch_leaves_output_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vdso = dir.path().join("libvdso.so");
        let output = dir.path().join("vdso-image.c");
        let (blob, _) = fake_vdso(&[1]);
        fs::write(&vdso, blob).unwrap();

        let symbols = symbol_map(&["alpha", "bravo"]);
        let err = build_image_file(&vdso, &output, &symbols, &ImageOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::CountMismatch {
                found: 2,
                symbols: 2
            }
        ));
        assert_eq!(err.category(), Category::Structure);
        assert!(!output.exists());
    }

    #[test]
    fn test_misaligned_slot_leaves_output_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vdso = dir.path().join("libvdso.so");
        let output = dir.path().join("vdso-image.c");

        let mut blob = filler(4, 0);
        blob.extend_from_slice(&marker(1));
        blob.extend_from_slice(&filler(16, 0x10));
        blob.extend_from_slice(&marker(1));
        blob.extend_from_slice(&filler(16, 0x20));
        assert_eq!(blob.len(), 52);
        fs::write(&vdso, blob).unwrap();

        let symbols = symbol_map(&["alpha"]);
        let err = build_image_file(&vdso, &output, &symbols, &ImageOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::MisalignedSlot {
                offset: 4,
                align: 8,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 3);
        assert!(!output.exists());
    }

    #[test]
    fn test_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let vdso = dir.path().join("libvdso.so");
        let output = dir.path().join("vdso-image.c");
        let (blob, _) = fake_vdso(&[3, 9]);
        fs::write(&vdso, blob).unwrap();

        let symbols = symbol_map(&["alpha", "bravo"]);
        let image =
            build_image_file(&vdso, &output, &symbols, &ImageOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), image.source);
    }

    #[test]
    fn test_descriptor_options() {
        let (options, symbols) = load_symbols(&fixture("descriptors", "full.xml")).unwrap();
        assert_eq!(symbols.len(), 2);

        let mut blob = filler(16, 0);
        let mut opening = [0u8; 8];
        opening[..4].copy_from_slice(&5u32.to_le_bytes());
        opening[4..].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        let mut second = opening;
        second[..4].copy_from_slice(&6u32.to_le_bytes());
        for m in [opening, opening, second, second] {
            blob.extend_from_slice(&m);
            blob.extend_from_slice(&filler(8, 0x30));
        }

        let image = build_image(&blob, &symbols, &options).unwrap();
        assert!(image.source.contains(
            "} uk_vdso __attribute__((aligned(8192))) __attribute__((section(\".rodata.vdso\"))) = {"
        ));
        assert!(image.source.contains("void uk_vdso_ctor(void) {"));
        assert!(image.source.contains("    uk_vdso_base = (char*)&uk_vdso;"));
        assert!(image.source.contains(
            "    uk_vdso.getpid_addr = (void *)((char *)&uk_syscall_r_getpid - (char *)&uk_vdso);"
        ));
    }
}

#[cfg(test)]
mod descriptor_file {
    use super::*;

    #[test]
    fn test_defaults() {
        let xml = fs::read_to_string(fixture("descriptors", "defaults.xml")).unwrap();
        let desc = descriptor::parse("defaults.xml", &xml).unwrap();
        assert_eq!(desc.options, ImageOptions::default());
        assert_eq!(desc.symbols.len(), 1);
    }

    #[test]
    fn test_full() {
        let xml = fs::read_to_string(fixture("descriptors", "full.xml")).unwrap();
        let desc = descriptor::parse("full.xml", &xml).unwrap();
        assert_eq!(desc.options.magic, 0x1234_5678);
        assert_eq!(desc.options.align, 0x2000);
        assert_eq!(desc.options.row_width, 16);
        assert_eq!(desc.options.struct_name, "uk_vdso");
        assert_eq!(
            desc.symbols.get(1).unwrap().source_symbol,
            "uk_syscall_r_getpid"
        );
    }

    #[test]
    fn test_missing_export() {
        check_missing("missing_export.xml", "export", "relocation")
    }

    #[test]
    fn test_invalid_attrs() {
        check_error(
            "invalid_attrs.xml",
            "Error: invalid attribute 'offset' on element 'relocation': ",
        )
    }

    #[test]
    fn test_bad_align() {
        check_error(
            "bad_align.xml",
            "Error: align 0xbb8 is not a power of two on element 'vdso_image'",
        )
    }

    #[test]
    fn test_malformed_magic() {
        check_error("malformed_magic.xml", "Error: failed to parse integer '0x36_9Cz' on element 'vdso_image': invalid digit found in string")
    }

    #[test]
    fn test_wide_magic() {
        check_error(
            "wide_magic.xml",
            "Error: magic 0x369c217132b8c1ab does not fit in 32 bits on element 'vdso_image'",
        )
    }

    #[test]
    fn test_bad_identifier() {
        check_error(
            "bad_identifier.xml",
            "Error: 'kernel-vsyscall' is not a valid C identifier for attribute 'symbol' on element 'relocation'",
        )
    }

    #[test]
    fn test_unknown_element() {
        check_error("unknown_element.xml", "Error: invalid XML element 'symbol'")
    }

    #[test]
    fn test_stray_text() {
        check_error(
            "stray_text.xml",
            "Error: unexpected text found in element 'vdso_image'",
        )
    }

    #[test]
    fn test_reserved_symbol() {
        check_error(
            "reserved_symbol.xml",
            "reserved_symbol.xml: source symbol 'uk_vdso_ctor' clashes with the constructor",
        )
    }

    #[test]
    fn test_wrong_root() {
        check_error(
            "wrong_root.xml",
            "Error: expected root element 'vdso_image' on element 'system'",
        )
    }

    #[test]
    fn test_duplicate_export() {
        check_error(
            "duplicate_export.xml",
            "duplicate_export.xml: exported name 'slot' appears more than once",
        )
    }
}

#[cfg(test)]
mod memory_map {
    use super::*;

    fn parse_fixture(name: &str) -> Result<ukvdso_tool::memmap::KernelFacts> {
        let file = fs::File::open(fixture("maps", name)).unwrap();
        parse_memory_map(std::io::BufReader::new(file), &MapQuery::default())
    }

    #[test]
    fn test_objdump_facts() {
        let facts = parse_fixture("objdump_x.txt").unwrap();
        assert_eq!(facts.ro_segment.offset, 0x1000);
        assert_eq!(facts.ro_segment.vaddr, 0x401000);
        assert_eq!(facts.struct_vaddr, 0x401500);
        assert_eq!(facts.monotonic_clock, 0x105380);
        assert_eq!(facts.wall_clock, 0x1053f0);
    }

    #[test]
    fn test_missing_struct() {
        let err = parse_fixture("missing_struct.txt").unwrap_err();
        match &err {
            Error::MissingFacts(missing) => assert_eq!(missing, &["symbol 'vdso_image'"]),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_every_missing_symbol_is_reported() {
        let err = parse_fixture("ro_segment_only.txt").unwrap_err();
        assert_eq!(
            err.to_string(),
            "memory map is missing: symbol 'vdso_image', symbol 'ukplat_monotonic_clock', symbol 'ukplat_wall_clock'"
        );
        assert_eq!(err.category(), Category::MissingFact);
    }

    #[test]
    fn test_no_ro_segment() {
        let err = parse_fixture("symbols_only.txt").unwrap_err();
        assert!(matches!(err, Error::NoReadOnlySegment));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_two_ro_segments() {
        let err = parse_fixture("two_ro_segments.txt").unwrap_err();
        assert!(matches!(
            err,
            Error::AmbiguousReadOnlySegment { ref lines } if lines == &[3, 5]
        ));
    }
}

#[cfg(test)]
mod rewrite {
    use super::*;

    const KERNEL_SIZE: usize = 0x3000;

    struct FakeCompiler {
        vdso: Vec<u8>,
        called: Cell<bool>,
    }

    impl FakeCompiler {
        fn new(len: usize) -> FakeCompiler {
            FakeCompiler {
                vdso: filler(len, 0x55),
                called: Cell::new(false),
            }
        }
    }

    impl VdsoCompiler for FakeCompiler {
        fn compile(&self, defines: &CompileDefines) -> Result<Vec<u8>> {
            assert_eq!(defines.hz, 100);
            assert_eq!(defines.vdso_image, 0x401500);
            self.called.set(true);
            Ok(self.vdso.clone())
        }
    }

    #[cfg(unix)]
    struct FailingCompiler;

    #[cfg(unix)]
    impl VdsoCompiler for FailingCompiler {
        fn compile(&self, _defines: &CompileDefines) -> Result<Vec<u8>> {
            use std::os::unix::process::ExitStatusExt;

            Err(Error::ToolchainFailed {
                command: "gcc vdso.c -o vdso.so".to_string(),
                status: std::process::ExitStatus::from_raw(1 << 8),
                stderr: "vdso.c:3:1: error: unknown type name 'uint64'".to_string(),
            })
        }
    }

    struct Scratch {
        _dir: tempfile::TempDir,
        kernel: PathBuf,
        original: Vec<u8>,
    }

    fn scratch_kernel(size: usize) -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("app_qemu-x86_64");
        let original = vec![0xee; size];
        fs::write(&kernel, &original).unwrap();
        Scratch {
            _dir: dir,
            kernel,
            original,
        }
    }

    fn env<'a>(
        hz: Option<&'a str>,
        kernel: Option<&'a PathBuf>,
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| match name {
            "CONFIG_HZ" => hz.map(str::to_string),
            "KERNEL_IMAGE_PATH" => kernel.map(|k| k.display().to_string()),
            _ => None,
        }
    }

    fn map() -> std::io::BufReader<fs::File> {
        std::io::BufReader::new(fs::File::open(fixture("maps", "objdump_x.txt")).unwrap())
    }

    #[test]
    fn test_patches_in_place() {
        let scratch = scratch_kernel(KERNEL_SIZE);
        let compiler = FakeCompiler::new(0x180);

        let summary = rewrite_kernel(
            env(Some("100"), Some(&scratch.kernel)),
            map(),
            &compiler,
            &RewriteOptions::default(),
        )
        .unwrap();
        assert_eq!(summary.offset, 0x1500);
        assert_eq!(summary.len, 0x180);
        assert!(summary.written);

        let patched = fs::read(&scratch.kernel).unwrap();
        assert_eq!(patched.len(), KERNEL_SIZE);
        assert_eq!(&patched[..0x1500], &scratch.original[..0x1500]);
        assert_eq!(&patched[0x1500..0x1680], compiler.vdso.as_slice());
        assert_eq!(&patched[0x1680..], &scratch.original[0x1680..]);
    }

    #[test]
    fn test_missing_hz() {
        let scratch = scratch_kernel(KERNEL_SIZE);
        let compiler = FakeCompiler::new(0x10);

        let err = rewrite_kernel(
            env(None, Some(&scratch.kernel)),
            map(),
            &compiler,
            &RewriteOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingEnv("CONFIG_HZ")));
        assert_eq!(err.exit_code(), 2);
        assert!(!compiler.called.get());
        assert_eq!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }

    #[test]
    fn test_missing_kernel_path() {
        let scratch = scratch_kernel(KERNEL_SIZE);
        let compiler = FakeCompiler::new(0x10);

        let err = rewrite_kernel(env(Some("100"), None), map(), &compiler, &RewriteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::MissingEnv("KERNEL_IMAGE_PATH")));
        assert!(!compiler.called.get());
        assert_eq!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }

    #[cfg(unix)]
    #[test]
    fn test_compiler_failure() {
        let scratch = scratch_kernel(KERNEL_SIZE);

        let err = rewrite_kernel(
            env(Some("100"), Some(&scratch.kernel)),
            map(),
            &FailingCompiler,
            &RewriteOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.category(), Category::Toolchain);
        assert_eq!(err.exit_code(), 5);
        assert!(err
            .to_string()
            .ends_with("\nvdso.c:3:1: error: unknown type name 'uint64'"));
        assert_eq!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }

    #[test]
    fn test_dry_run() {
        let scratch = scratch_kernel(KERNEL_SIZE);
        let compiler = FakeCompiler::new(0x40);
        let options = RewriteOptions {
            dry_run: true,
            ..RewriteOptions::default()
        };

        let summary = rewrite_kernel(
            env(Some("100"), Some(&scratch.kernel)),
            map(),
            &compiler,
            &options,
        )
        .unwrap();
        assert!(!summary.written);
        assert_eq!(summary.offset, 0x1500);
        assert!(compiler.called.get());
        assert_eq!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }

    #[test]
    fn test_backup() {
        let scratch = scratch_kernel(KERNEL_SIZE);
        let backup = scratch.kernel.with_extension("orig");
        let compiler = FakeCompiler::new(0x40);
        let options = RewriteOptions {
            backup: Some(backup.clone()),
            ..RewriteOptions::default()
        };

        rewrite_kernel(
            env(Some("100"), Some(&scratch.kernel)),
            map(),
            &compiler,
            &options,
        )
        .unwrap();
        assert_eq!(fs::read(&backup).unwrap(), scratch.original);
        assert_ne!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }

    #[test]
    fn test_out_of_bounds() {
        let scratch = scratch_kernel(0x1600);
        let compiler = FakeCompiler::new(0x200);

        let err = rewrite_kernel(
            env(Some("100"), Some(&scratch.kernel)),
            map(),
            &compiler,
            &RewriteOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::PatchOutOfBounds {
                offset: 0x1500,
                len: 0x200,
                file_len: 0x1600,
                ..
            }
        ));
        assert_eq!(err.category(), Category::Io);
        assert_eq!(fs::read(&scratch.kernel).unwrap(), scratch.original);
    }
}
