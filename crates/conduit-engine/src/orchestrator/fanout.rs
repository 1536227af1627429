//! Scans an orchestrator-agent reply for `@name` fan-out markers and
//! substitutes each one with its delegate's result once the batch completes.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

static MARKER_RE: OnceLock<Regex> = OnceLock::new();

fn marker_re() -> &'static Regex {
    MARKER_RE.get_or_init(|| Regex::new(r"^@([A-Za-z0-9_-]+)\s*:?\s*(.*)$").unwrap())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanoutBlock {
    pub agent_name: String,
    pub task_text: String,
    start_line: usize,
    end_line: usize,
}

/// A delegation block opens at a line matching `@name[: ]...` for a known
/// agent, and extends until the next such marker or a run of two or more
/// blank lines.
pub fn scan_fanout_markers(reply: &str, known_agents: &[&str]) -> Vec<FanoutBlock> {
    let lines: Vec<&str> = reply.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = marker_re().captures(lines[i]) else {
            i += 1;
            continue;
        };
        let name = caps.get(1).unwrap().as_str();
        if !known_agents.contains(&name) {
            i += 1;
            continue;
        }

        let start = i;
        let mut task_lines = vec![caps.get(2).unwrap().as_str().to_string()];
        let mut j = i + 1;
        let mut blank_run = 0;

        while j < lines.len() {
            if let Some(next) = marker_re().captures(lines[j]) {
                if known_agents.contains(&next.get(1).unwrap().as_str()) {
                    break;
                }
            }
            if lines[j].trim().is_empty() {
                blank_run += 1;
                if blank_run >= 2 {
                    break;
                }
            } else {
                blank_run = 0;
            }
            task_lines.push(lines[j].to_string());
            j += 1;
        }

        blocks.push(FanoutBlock { agent_name: name.to_string(), task_text: task_lines.join("\n").trim().to_string(), start_line: start, end_line: j });
        i = j;
    }

    blocks
}

/// Replaces each block's line span with `results[block_index]` (or a
/// placeholder if a result is missing), leaving everything outside the
/// blocks untouched.
pub fn substitute_blocks(reply: &str, blocks: &[FanoutBlock], results: &HashMap<usize, String>) -> String {
    let lines: Vec<&str> = reply.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut cursor = 0;

    for (index, block) in blocks.iter().enumerate() {
        out.extend(lines[cursor..block.start_line].iter().map(|s| s.to_string()));
        out.push(results.get(&index).cloned().unwrap_or_else(|| format!("[{} produced no output]", block.agent_name)));
        cursor = block.end_line;
    }
    out.extend(lines[cursor..].iter().map(|s| s.to_string()));

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_marker_extends_to_end_of_input() {
        let reply = "@reviewer: please check the diff\nfor correctness issues";
        let blocks = scan_fanout_markers(reply, &["reviewer"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].agent_name, "reviewer");
        assert_eq!(blocks[0].task_text, "please check the diff\nfor correctness issues");
    }

    #[test]
    fn second_marker_closes_the_first_block() {
        let reply = "@reviewer: check the diff\n@tester: run the suite";
        let blocks = scan_fanout_markers(reply, &["reviewer", "tester"]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].task_text, "check the diff");
        assert_eq!(blocks[1].task_text, "run the suite");
    }

    #[test]
    fn double_blank_line_closes_a_block() {
        let reply = "@reviewer: check the diff\n\n\nunrelated trailing text";
        let blocks = scan_fanout_markers(reply, &["reviewer"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].task_text, "check the diff");
    }

    #[test]
    fn unknown_agent_name_is_not_treated_as_a_marker() {
        let reply = "@nobody: do something\nplain text";
        let blocks = scan_fanout_markers(reply, &["reviewer"]);
        assert!(blocks.is_empty());
    }

    #[test]
    fn substitution_replaces_only_the_marker_span() {
        let reply = "Intro line.\n@reviewer: check it\nclosing remark";
        let blocks = scan_fanout_markers(reply, &["reviewer"]);
        let mut results = HashMap::new();
        results.insert(0, "review done: looks good".to_string());
        let out = substitute_blocks(reply, &blocks, &results);
        assert_eq!(out, "Intro line.\nreview done: looks good\nclosing remark");
    }
}
