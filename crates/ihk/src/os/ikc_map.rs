/// IKC map text format: `<cpulist>:<host_cpu>+<cpulist>:<host_cpu>...`
///
/// A cpulist is comma separated indices and inclusive ranges (`0,2,4-7`).

use super::boot_param::IkcMapEntry;
use crate::error::{IhkError, Result};
use crate::types::CpuId;
use std::collections::HashSet;

/// Parse `0,2,4-7` into individual CPUs, in order of appearance. Every
/// index must be below `num_cpus`.
pub fn parse_cpulist(text: &str, num_cpus: usize) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(IhkError::invalid(format!("empty element in cpulist '{}'", text)));
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_index(lo, num_cpus)?;
                let hi = parse_index(hi, num_cpus)?;
                if lo > hi {
                    return Err(IhkError::invalid(format!("descending range '{}'", part)));
                }
                cpus.extend((lo..=hi).map(CpuId));
            }
            None => cpus.push(CpuId(parse_index(part, num_cpus)?)),
        }
    }
    Ok(cpus)
}

fn parse_index(text: &str, num_cpus: usize) -> Result<u32> {
    let index = text
        .trim()
        .parse::<u32>()
        .map_err(|_| IhkError::invalid(format!("bad cpu index '{}'", text)))?;
    if index as usize >= num_cpus {
        return Err(IhkError::invalid(format!(
            "cpu index {} outside {} cpus",
            index, num_cpus
        )));
    }
    Ok(index)
}

/// Parse a full map for a chip of `num_cpus` CPUs. Each LWK CPU may appear
/// once.
pub fn parse_ikc_map(text: &str, num_cpus: usize) -> Result<Vec<IkcMapEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for group in text.trim().split('+') {
        let (cpulist, target) = group
            .split_once(':')
            .ok_or_else(|| IhkError::invalid(format!("missing ':' in '{}'", group)))?;
        let target = CpuId(parse_index(target, num_cpus)?);
        for lwk_cpu in parse_cpulist(cpulist, num_cpus)? {
            if !seen.insert(lwk_cpu) {
                return Err(IhkError::invalid(format!("{} mapped twice", lwk_cpu)));
            }
            entries.push(IkcMapEntry { lwk_cpu, target });
        }
    }
    Ok(entries)
}

/// Render CPUs back into compact cpulist form
pub fn format_cpulist(cpus: &[CpuId]) -> String {
    let mut sorted: Vec<u32> = cpus.iter().map(|c| c.0).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}

/// Render a map, grouping LWK CPUs by target
pub fn format_ikc_map(entries: &[IkcMapEntry]) -> String {
    let mut targets: Vec<CpuId> = entries.iter().map(|e| e.target).collect();
    targets.sort_unstable();
    targets.dedup();

    targets
        .into_iter()
        .map(|target| {
            let cpus: Vec<CpuId> = entries
                .iter()
                .filter(|e| e.target == target)
                .map(|e| e.lwk_cpu)
                .collect();
            format!("{}:{}", format_cpulist(&cpus), target.0)
        })
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPUS: usize = 16;

    #[test]
    fn cpulist_ranges() {
        let cpus = parse_cpulist("0,2,4-6", CPUS).unwrap();
        assert_eq!(cpus, vec![CpuId(0), CpuId(2), CpuId(4), CpuId(5), CpuId(6)]);
        assert_eq!(format_cpulist(&cpus), "0,2,4-6");
    }

    #[test]
    fn cpulist_rejects_garbage() {
        assert!(parse_cpulist("", CPUS).is_err());
        assert!(parse_cpulist("1,,2", CPUS).is_err());
        assert!(parse_cpulist("5-3", CPUS).is_err());
        assert!(parse_cpulist("a", CPUS).is_err());
        assert!(parse_cpulist("-1", CPUS).is_err());
    }

    #[test]
    fn map_groups() {
        let map = parse_ikc_map("4-5:0+6,7:1", CPUS).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map[2], IkcMapEntry { lwk_cpu: CpuId(6), target: CpuId(1) });
        assert_eq!(format_ikc_map(&map), "4-5:0+6-7:1");
    }

    #[test]
    fn map_rejects_duplicates_and_missing_target() {
        assert!(parse_ikc_map("4-5:0+5:1", CPUS).is_err());
        assert!(parse_ikc_map("4-5", CPUS).is_err());
        assert!(parse_ikc_map("4:x", CPUS).is_err());
    }

    #[test]
    fn indices_are_bounded_by_the_chip() {
        assert!(parse_cpulist("15", CPUS).is_ok());
        assert!(parse_cpulist("16", CPUS).is_err());
        assert!(parse_cpulist("0-16", CPUS).is_err());
        assert!(parse_cpulist("0-4294967295", CPUS).is_err());
        assert!(parse_cpulist("0-99999999999", CPUS).is_err());
        assert!(parse_ikc_map("0-200000:1", CPUS).is_err());
        assert!(parse_ikc_map("4:16", CPUS).is_err());
        assert!(parse_ikc_map("20:1", CPUS).is_err());
    }
}
