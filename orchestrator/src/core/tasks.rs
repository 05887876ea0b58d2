//! Task list parsing for implement batches.
//!
//! A task list is markdown: every `## ` heading opens a section and every
//! checklist line (`- [ ] T001 ...`, `- [x] T002 ...`) contributes its task
//! id to the current section. Lines before the first heading land in a
//! section named `Tasks`.

use std::sync::LazyLock;

use regex::Regex;

use crate::state::{Batch, BatchStatus, Batches};

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+(?P<name>.+?)\s*$").expect("heading regex is valid"));

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[(?P<mark>[ xX])\]\s+(?P<id>T\d+)\b")
        .expect("task line regex is valid")
});

const PREAMBLE_SECTION: &str = "Tasks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSection {
    pub name: String,
    pub task_ids: Vec<String>,
    pub checked: usize,
}

/// Checked and total task counts over the whole list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskSummary {
    pub total: usize,
    pub checked: usize,
}

impl TaskSummary {
    pub fn all_checked(self) -> bool {
        self.total > 0 && self.checked == self.total
    }
}

/// Parse sections in document order, skipping sections without task ids.
pub fn parse_sections(contents: &str) -> Vec<TaskSection> {
    let mut sections: Vec<TaskSection> = Vec::new();
    let mut current = TaskSection {
        name: PREAMBLE_SECTION.to_string(),
        task_ids: Vec::new(),
        checked: 0,
    };

    for line in contents.lines() {
        if let Some(caps) = HEADING.captures(line) {
            let finished = std::mem::replace(
                &mut current,
                TaskSection {
                    name: caps["name"].to_string(),
                    task_ids: Vec::new(),
                    checked: 0,
                },
            );
            if !finished.task_ids.is_empty() {
                sections.push(finished);
            }
            continue;
        }
        if let Some(caps) = TASK_LINE.captures(line) {
            current.task_ids.push(caps["id"].to_string());
            if !caps["mark"].trim().is_empty() {
                current.checked += 1;
            }
        }
    }
    if !current.task_ids.is_empty() {
        sections.push(current);
    }
    sections
}

pub fn summarize(contents: &str) -> TaskSummary {
    parse_sections(contents)
        .iter()
        .fold(TaskSummary::default(), |acc, section| TaskSummary {
            total: acc.total + section.task_ids.len(),
            checked: acc.checked + section.checked,
        })
}

/// Build the batch list in one go: one pending batch per section, indexed in
/// document order.
pub fn batches_from_sections(sections: &[TaskSection]) -> Batches {
    let items: Vec<Batch> = sections
        .iter()
        .enumerate()
        .map(|(index, section)| Batch {
            index: index as u32,
            section: section.name.clone(),
            task_ids: section.task_ids.clone(),
            status: BatchStatus::Pending,
            workflow_id: None,
            heal_attempts: 0,
        })
        .collect();
    Batches {
        total: items.len() as u32,
        current: 0,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASKS: &str = "\
# Tasks: checkout flow

- [x] T001 Scaffold crate

## Phase 1: Setup
- [x] T002 Add config loader
- [ ] T003 [P] Wire logging

## Notes
Nothing actionable here.

## Phase 2: Core
* [ ] T004 Implement cart
  - [X] T005 Price rules
";

    #[test]
    fn sections_follow_headings_and_skip_empty_ones() {
        let sections = parse_sections(TASKS);
        let names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Tasks", "Phase 1: Setup", "Phase 2: Core"]);
        assert_eq!(sections[1].task_ids, vec!["T002", "T003"]);
        assert_eq!(sections[2].task_ids, vec!["T004", "T005"]);
        assert_eq!(sections[2].checked, 1);
    }

    #[test]
    fn summary_counts_checked_tasks() {
        let summary = summarize(TASKS);
        assert_eq!(summary, TaskSummary { total: 5, checked: 3 });
        assert!(!summary.all_checked());
        assert!(summarize("- [x] T001 done\n").all_checked());
        assert!(!summarize("no tasks").all_checked());
    }

    #[test]
    fn batches_are_indexed_in_document_order() {
        let batches = batches_from_sections(&parse_sections(TASKS));
        assert_eq!(batches.total, 3);
        assert_eq!(batches.current, 0);
        for (position, batch) in batches.items.iter().enumerate() {
            assert_eq!(batch.index as usize, position);
            assert_eq!(batch.status, BatchStatus::Pending);
        }
    }

    #[test]
    fn empty_list_yields_no_batches() {
        assert!(parse_sections("# Tasks\n\nTBD\n").is_empty());
        assert_eq!(batches_from_sections(&[]).total, 0);
    }
}
