#![cfg(feature = "cli")]

use std::{
    fs,
    path::Path,
    process::{Command, Output},
};

const HEADERS_SIZE: usize = 0x400;
const SECTION_SIZE: usize = 0x200;

fn put16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}
fn put32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Builds a PE32 image based at 0x400000 with one 0x200 byte raw section per entry,
/// the first at virtual address 0x1000 and each following one 0x1000 further.
fn build_image(sections: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut image = vec![0u8; HEADERS_SIZE + sections.len() * SECTION_SIZE];
    put16(&mut image, 0, 0x5a4d);
    put32(&mut image, 0x3c, 0x40);
    put32(&mut image, 0x40, 0x00004550);

    let coff = 0x44;
    put16(&mut image, coff, 0x014c);
    put16(&mut image, coff + 2, sections.len() as u16);
    put16(&mut image, coff + 16, 224);

    let optional = coff + 20;
    put16(&mut image, optional, 0x010b);
    put32(&mut image, optional + 28, 0x400000);
    put32(&mut image, optional + 64, 0x12345678);
    put32(&mut image, optional + 92, 16);

    let section_table = optional + 224;
    for (index, (name, data)) in sections.iter().enumerate() {
        let entry = section_table + index * 40;
        let mut packed = [0u8; 8];
        packed[..name.len()].copy_from_slice(name.as_bytes());
        image[entry..entry + 8].copy_from_slice(&packed);
        let raw = HEADERS_SIZE + index * SECTION_SIZE;
        put32(&mut image, entry + 8, data.len().max(1) as u32);
        put32(&mut image, entry + 12, 0x1000 * (index as u32 + 1));
        put32(&mut image, entry + 16, SECTION_SIZE as u32);
        put32(&mut image, entry + 20, raw as u32);
        image[raw..raw + data.len()].copy_from_slice(data);
    }
    image
}

fn record(address: u32, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&address.to_le_bytes());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(payload);
    data
}

fn pepatch(args: &[&str], image: Option<&Path>) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_pepatch"));
    command.args(args);
    if let Some(image) = image {
        command.arg(image);
    }
    command.output().unwrap()
}

#[test]
fn usage_errors() {
    let output = pepatch(&[], None);
    assert_eq!(output.status.code(), Some(1), "missing subcommand");
    assert!(!output.stderr.is_empty(), "usage printed");

    let output = pepatch(&["patch"], None);
    assert_eq!(output.status.code(), Some(1), "missing image argument");

    let output = pepatch(&["setvs", "image.exe", ".text", "nope"], None);
    assert_eq!(output.status.code(), Some(1), "invalid size");

    let output = pepatch(&["--help"], None);
    assert_eq!(output.status.code(), Some(0), "help is not an error");
}

#[test]
fn patch_missing_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.exe");
    let data = build_image(&[(".text", vec![0x90; 16])]);
    fs::write(&path, &data).unwrap();

    let output = pepatch(&["patch"], Some(path.as_path()));
    assert_eq!(output.status.code(), Some(0), "missing section is not an error");
    assert_eq!(fs::read(&path).unwrap(), data, "file untouched");
}

#[test]
fn patch_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.exe");
    let stream = record(0x401004, &[0xde, 0xad, 0xbe, 0xef]);
    fs::write(&path, build_image(&[(".text", vec![0x90; 16]), (".patch", stream)])).unwrap();

    let output = pepatch(&["patch"], Some(path.as_path()));
    assert_eq!(output.status.code(), Some(0));

    let patched = fs::read(&path).unwrap();
    assert_eq!(&patched[HEADERS_SIZE + 4..HEADERS_SIZE + 8], &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn patch_failures() {
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("unresolved.exe");
    let data = build_image(&[(".text", vec![0x90; 16]), (".patch", record(0x409000, &[1]))]);
    fs::write(&path, &data).unwrap();
    let output = pepatch(&["patch"], Some(path.as_path()));
    assert_eq!(output.status.code(), Some(1), "unresolved address");
    assert_eq!(fs::read(&path).unwrap(), data, "failed run leaves file untouched");

    let path = dir.path().join("overlap.exe");
    let mut stream = record(0x401000, &[1; 8]);
    stream.extend(record(0x401004, &[2; 8]));
    let data = build_image(&[(".text", vec![0x90; 16]), (".patch", stream)]);
    fs::write(&path, &data).unwrap();
    let output = pepatch(&["patch", "--strict"], Some(path.as_path()));
    assert_eq!(output.status.code(), Some(1), "overlap denied");
    assert_eq!(fs::read(&path).unwrap(), data);

    let output = pepatch(&["patch"], Some(dir.path().join("missing.exe").as_path()));
    assert_eq!(output.status.code(), Some(1), "unreadable file");
}

#[test]
fn setvs_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.exe");
    fs::write(&path, build_image(&[(".text", vec![0x90; 16])])).unwrap();

    let output = pepatch(&["setvs"], Some(path.as_path()));
    assert_eq!(output.status.code(), Some(1), "missing section and size");

    let output = Command::new(env!("CARGO_BIN_EXE_pepatch"))
        .arg("setvs")
        .arg(&path)
        .args([".text", "0x2000"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let data = fs::read(&path).unwrap();
    let entry = 0x44 + 20 + 224;
    assert_eq!(&data[entry + 8..entry + 12], &0x2000u32.to_le_bytes());

    let output = Command::new(env!("CARGO_BIN_EXE_pepatch"))
        .arg("setvs")
        .arg(&path)
        .args([".nothere", "16"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1), "unknown section");
}
