//! Persistent decomposition file (spec.md §6 "Persistence").
//!
//! A plain-ASCII record of one decomposition's global shape and each
//! writing task's local map, so a later run (possibly with a different
//! task count) can reconstruct an `IoDesc` without recomputing the map.
//!
//! Reference: spec.md §6, §9 "decomposition-file reader task-count mismatch".

use std::fmt::Write as _;
use std::io;

pub const DECOMP_FILE_VERSION: i32 = 2001;

/// One decomposition, as read from or about to be written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompFile {
    pub version: i32,
    pub gdimlen: Vec<i64>,
    /// `task_maps[i]` is the map that task `i` held when the file was written.
    pub task_maps: Vec<Vec<i64>>,
}

/// Serialize `gdimlen`/`task_maps` to the on-disk ASCII format.
pub fn serialize(gdimlen: &[i64], task_maps: &[Vec<i64>]) -> String {
    let mut out = String::new();
    writeln!(out, "{DECOMP_FILE_VERSION}").unwrap();
    write!(out, "{}", gdimlen.len()).unwrap();
    for d in gdimlen {
        write!(out, " {d}").unwrap();
    }
    writeln!(out).unwrap();
    writeln!(out, "{}", task_maps.len()).unwrap();
    for (rank, map) in task_maps.iter().enumerate() {
        write!(out, "{rank} {}", map.len()).unwrap();
        for &m in map {
            write!(out, " {m}").unwrap();
        }
        writeln!(out).unwrap();
    }
    out
}

/// Parse the ASCII format produced by [`serialize`].
pub fn parse(contents: &str) -> io::Result<DecompFile> {
    let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
    let mut lines = contents.lines();

    let version: i32 = lines
        .next()
        .ok_or_else(|| bad("missing version line"))?
        .trim()
        .parse()
        .map_err(|_| bad("bad version"))?;
    if version != DECOMP_FILE_VERSION {
        return Err(bad("unsupported decomposition file version"));
    }

    let dims_line = lines.next().ok_or_else(|| bad("missing dims line"))?;
    let mut dims_fields = dims_line.split_whitespace();
    let ndims: usize = dims_fields
        .next()
        .ok_or_else(|| bad("missing ndims"))?
        .parse()
        .map_err(|_| bad("bad ndims"))?;
    let gdimlen: Vec<i64> = dims_fields
        .map(|s| s.parse().map_err(|_| bad("bad gdimlen entry")))
        .collect::<io::Result<_>>()?;
    if gdimlen.len() != ndims {
        return Err(bad("gdimlen length mismatch"));
    }

    let ntasks: usize = lines
        .next()
        .ok_or_else(|| bad("missing task count"))?
        .trim()
        .parse()
        .map_err(|_| bad("bad task count"))?;

    let mut task_maps = Vec::with_capacity(ntasks);
    for _ in 0..ntasks {
        let line = lines.next().ok_or_else(|| bad("missing task line"))?;
        let mut fields = line.split_whitespace();
        let _rank: i32 = fields.next().ok_or_else(|| bad("missing rank"))?.parse().map_err(|_| bad("bad rank"))?;
        let ndof: usize = fields.next().ok_or_else(|| bad("missing ndof"))?.parse().map_err(|_| bad("bad ndof"))?;
        let map: Vec<i64> = fields
            .map(|s| s.parse().map_err(|_| bad("bad map entry")))
            .collect::<io::Result<_>>()?;
        if map.len() != ndof {
            return Err(bad("ndof/map length mismatch"));
        }
        task_maps.push(map);
    }

    Ok(DecompFile {
        version,
        gdimlen,
        task_maps,
    })
}

pub fn write_decomp_file(path: &std::path::Path, gdimlen: &[i64], task_maps: &[Vec<i64>]) -> io::Result<()> {
    std::fs::write(path, serialize(gdimlen, task_maps))
}

pub fn read_decomp_file(path: &std::path::Path) -> io::Result<DecompFile> {
    let contents = std::fs::read_to_string(path)?;
    parse(&contents)
}

/// The map task `rank` should use when re-reading a decomposition file
/// under `num_ranks_now` tasks, which may differ from the task count the
/// file was written with.
///
/// Reference: spec.md §9 resolution — a rank with no corresponding stored
/// map (because the file holds fewer maps than `num_ranks_now`, i.e. this
/// run uses more readers than were used to write the file) receives an
/// empty map rather than an error.
pub fn map_for_rank(file: &DecompFile, rank: i32, num_ranks_now: i32) -> Vec<i64> {
    let _ = num_ranks_now;
    file.task_maps.get(rank as usize).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let gdimlen = vec![2, 3];
        let task_maps = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let text = serialize(&gdimlen, &task_maps);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.version, DECOMP_FILE_VERSION);
        assert_eq!(parsed.gdimlen, gdimlen);
        assert_eq!(parsed.task_maps, task_maps);
    }

    #[test]
    fn test_extra_readers_receive_empty_maps() {
        let gdimlen = vec![4];
        let task_maps = vec![vec![1, 2], vec![3, 4]];
        let file = DecompFile {
            version: DECOMP_FILE_VERSION,
            gdimlen,
            task_maps,
        };
        assert_eq!(map_for_rank(&file, 0, 4), vec![1, 2]);
        assert_eq!(map_for_rank(&file, 1, 4), vec![3, 4]);
        assert_eq!(map_for_rank(&file, 2, 4), Vec::<i64>::new());
        assert_eq!(map_for_rank(&file, 3, 4), Vec::<i64>::new());
    }

    #[test]
    fn test_parse_rejects_truncated_input() {
        assert!(parse("2001\n1 4\n").is_err());
    }

    #[test]
    fn test_parse_rejects_ndof_mismatch() {
        let bad = "2001\n1 4\n1\n0 3 1 2\n";
        assert!(parse(bad).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        assert!(parse("9999\n1 4\n0\n").is_err());
    }
}
