//! File-string-table parsing: each entry is 12 bytes, the first entry's
//! `length` field gives the total entry count, and names live in a string
//! pool immediately following the entry array.

use crate::error::{Result, WbfsError};
use crate::wii::structs::FstEntry;

#[derive(Debug, Clone)]
pub enum FstNode {
    File { name: String, offset: u64, length: u64 },
    Dir { name: String, children: Vec<FstNode> },
}

/// Parses a raw FST buffer (entry array + string pool) into a tree.
pub fn parse_fst(data: &[u8]) -> Result<FstNode> {
    if data.len() < 12 {
        return Err(WbfsError::Format("fst buffer too small".into()));
    }
    let root = read_entry(data, 0)?;
    if !root.is_dir() {
        return Err(WbfsError::Format("fst root entry is not a directory".into()));
    }
    let entry_count = root.length as usize;
    if entry_count == 0 || entry_count * 12 > data.len() {
        return Err(WbfsError::Format("fst entry count out of range".into()));
    }
    let string_pool_off = entry_count * 12;
    let (node, _) = build_node(data, 0, entry_count, string_pool_off, String::new())?;
    Ok(node)
}

fn read_entry(data: &[u8], index: usize) -> Result<FstEntry> {
    let off = index * 12;
    let bytes: [u8; 12] = data
        .get(off..off + 12)
        .ok_or_else(|| WbfsError::Format("fst entry out of range".into()))?
        .try_into()
        .expect("slice of length 12");
    Ok(FstEntry {
        type_and_name_off: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
        data_offset: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        length: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
    })
}

fn read_name(data: &[u8], string_pool_off: usize, name_off: u32) -> String {
    let start = string_pool_off + name_off as usize;
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[start..end]).into_owned()
}

/// Recursively builds the tree starting at entry `index`, returning the
/// node and the index of the next sibling.
fn build_node(
    data: &[u8],
    index: usize,
    entry_count: usize,
    string_pool_off: usize,
    name: String,
) -> Result<(FstNode, usize)> {
    let entry = read_entry(data, index)?;
    if entry.is_dir() {
        let end = entry.length as usize;
        if end > entry_count {
            return Err(WbfsError::Format("fst directory end index out of range".into()));
        }
        let mut children = Vec::new();
        let mut i = index + 1;
        while i < end {
            let child_entry = read_entry(data, i)?;
            let child_name = read_name(data, string_pool_off, child_entry.name_offset());
            let (child, next) = build_node(data, i, entry_count, string_pool_off, child_name)?;
            children.push(child);
            i = next;
        }
        Ok((FstNode::Dir { name, children }, end))
    } else {
        Ok((
            FstNode::File {
                name,
                offset: entry.data_offset as u64,
                length: entry.length as u64,
            },
            index + 1,
        ))
    }
}

/// Invokes `visit` with `(byte_offset, byte_length)` for every file in the
/// tree, depth first.
pub fn for_each_file(node: &FstNode, visit: &mut impl FnMut(u64, u64)) {
    match node {
        FstNode::File { offset, length, .. } => visit(*offset, *length),
        FstNode::Dir { children, .. } => {
            for child in children {
                for_each_file(child, visit);
            }
        }
    }
}

/// Finds the file node at a `/`-separated path, if any.
pub fn find_file<'a>(node: &'a FstNode, path: &str) -> Option<&'a FstNode> {
    let mut components = path.trim_matches('/').split('/');
    let mut current = node;
    for component in &mut components {
        match current {
            FstNode::Dir { children, .. } => {
                current = children.iter().find(|c| node_name(c) == component)?;
            }
            FstNode::File { .. } => return None,
        }
    }
    match current {
        FstNode::File { .. } => Some(current),
        FstNode::Dir { .. } => None,
    }
}

fn node_name(node: &FstNode) -> &str {
    match node {
        FstNode::File { name, .. } => name,
        FstNode::Dir { name, .. } => name,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(type_: u8, name_off: u32, data: u32, len: u32) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = type_;
        buf[1..4].copy_from_slice(&name_off.to_be_bytes()[1..]);
        buf[4..8].copy_from_slice(&data.to_be_bytes());
        buf[8..12].copy_from_slice(&len.to_be_bytes());
        buf
    }

    #[test]
    fn parses_flat_fst_with_two_files() {
        let mut data = Vec::new();
        data.extend_from_slice(&entry(1, 0, 0, 3)); // root dir, 3 entries total
        data.extend_from_slice(&entry(0, 0, 0x1000, 0x20)); // file "a"
        data.extend_from_slice(&entry(0, 2, 0x2000, 0x40)); // file "b"
        data.extend_from_slice(b"a\0b\0");

        let fst = parse_fst(&data).unwrap();
        let mut seen = Vec::new();
        for_each_file(&fst, &mut |off, len| seen.push((off, len)));
        assert_eq!(seen, vec![(0x1000, 0x20), (0x2000, 0x40)]);

        let found = find_file(&fst, "b").unwrap();
        match found {
            FstNode::File { offset, length, .. } => {
                assert_eq!(*offset, 0x2000);
                assert_eq!(*length, 0x40);
            }
            _ => panic!("expected file"),
        }
    }
}
