//! Parsing of PowerShell `Format-Table` output.
//!
//! The second line is a ruler of dash runs, one per column, as wide as the
//! column header. Numeric columns are right-aligned so their values may start
//! left of the run; text columns are left-aligned and may extend past it. A
//! cell is therefore every token that overlaps the column's run, and a token
//! overlapping no run goes to the nearest one.

use mobdev_traits::wsa::ProcessTable;

type Span = (usize, usize);

fn is_ruler(line: &str) -> bool {
    line.contains('-') && line.chars().all(|c| c == '-' || c == ' ')
}

fn ruler_runs(ruler: &str) -> Vec<Span> {
    tokens(ruler).into_iter().map(|(start, end, _)| (start, end)).collect()
}

/// Whitespace-separated tokens with their character offsets.
fn tokens(line: &str) -> Vec<(usize, usize, &str)> {
    let mut out = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut pos = 0;

    for (byte_idx, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some((start, start_byte)) = current.take() {
                out.push((start, pos, &line[start_byte..byte_idx]));
            }
        } else if current.is_none() {
            current = Some((pos, byte_idx));
        }
        pos += 1;
    }
    if let Some((start, start_byte)) = current {
        out.push((start, pos, &line[start_byte..]));
    }
    out
}

fn column_for(token: Span, runs: &[Span]) -> usize {
    let (start, end) = token;
    runs.iter()
        .position(|&(s, e)| start < e && s < end)
        .unwrap_or_else(|| {
            runs.iter()
                .enumerate()
                .min_by_key(|(_, (s, e))| if end <= *s { s - end } else { start.saturating_sub(*e) })
                .map(|(idx, _)| idx)
                .unwrap_or(0)
        })
}

fn split_fixed(line: &str, runs: &[Span]) -> Vec<String> {
    let mut cells = vec![String::new(); runs.len()];
    for (start, end, text) in tokens(line) {
        let cell = &mut cells[column_for((start, end), runs)];
        if !cell.is_empty() {
            cell.push(' ');
        }
        cell.push_str(text);
    }
    cells
}

fn split_whitespace(line: &str, width: usize) -> Vec<String> {
    let mut cells: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    cells.resize(width.max(cells.len()), String::new());
    cells
}

pub fn parse_process_table(text: &str) -> ProcessTable {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();

    let Some(header_line) = lines.first() else {
        return ProcessTable::default();
    };

    match lines.get(1).filter(|line| is_ruler(line)) {
        Some(ruler) => {
            let runs = ruler_runs(ruler);
            ProcessTable {
                headers: split_fixed(header_line, &runs),
                rows: lines[2..].iter().map(|line| split_fixed(line, &runs)).collect(),
            }
        }
        None => {
            let headers: Vec<String> = header_line.split_whitespace().map(str::to_string).collect();
            let rows = lines[1..]
                .iter()
                .map(|line| split_whitespace(line, headers.len()))
                .collect();
            ProcessTable { headers, rows }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET_PROCESS: &str = "
Handles NPM       PM       WS      CPU    Id SI ProcessName
------- ---       --       --      ---    -- -- -----------
    456  34 29327360 62353408 1.234375 14556  1 WsaClient
    120  12  4096000  8192000          14600  1 WsaClient Helper

";

    #[test]
    fn test_parse_right_aligned_columns() {
        let table = parse_process_table(GET_PROCESS);
        assert_eq!(table.headers, vec!["Handles", "NPM", "PM", "WS", "CPU", "Id", "SI", "ProcessName"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0], vec!["456", "34", "29327360", "62353408", "1.234375", "14556", "1", "WsaClient"]);
    }

    #[test]
    fn test_parse_blank_cell_and_spaced_name() {
        let table = parse_process_table(GET_PROCESS);
        assert_eq!(table.cell(1, "CPU"), Some(""));
        assert_eq!(table.cell(1, "Id"), Some("14600"));
        assert_eq!(table.cell(1, "ProcessName"), Some("WsaClient Helper"));
    }

    #[test]
    fn test_parse_without_ruler_splits_on_whitespace() {
        let table = parse_process_table("Id ProcessName\n14556 WsaClient\n14600\n");
        assert_eq!(table.headers, vec!["Id", "ProcessName"]);
        assert_eq!(table.rows[1], vec!["14600", ""]);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_process_table("\n\n").is_empty());
        assert!(parse_process_table("").headers.is_empty());
    }

    #[test]
    fn test_tokens_use_character_offsets() {
        let toks = tokens("  é1 ab");
        assert_eq!(toks, vec![(2, 4, "é1"), (5, 7, "ab")]);
    }
}
