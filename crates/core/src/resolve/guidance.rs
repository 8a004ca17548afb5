//! Builder guidance accumulation.
//!
//! Guidance is a markdown document of iteration sections. Each weak cycle
//! appends a new `## Iteration N (latest)` section; the previous latest loses
//! its marker. When the document exceeds the character budget, whole oldest
//! sections are dropped first. The iteration number is monotonic and stored
//! on the experiment row, so numbering survives truncation.

const LATEST_SUFFIX: &str = " (latest)";

/// Append one iteration section, keeping the document within `budget` chars.
pub fn append_iteration(existing: &str, iteration: u32, section: &str, budget: usize) -> String {
    let mut sections = split_sections(existing);

    // Previous latest loses its marker.
    for s in &mut sections {
        if let Some(stripped) = s.header.strip_suffix(LATEST_SUFFIX) {
            s.header = stripped.to_string();
        }
    }

    sections.push(Section {
        header: format!("## Iteration {iteration}{LATEST_SUFFIX}"),
        body: section.trim().to_string(),
    });

    // Drop whole oldest sections while over budget, always keeping the newest.
    while sections.len() > 1 && rendered_len(&sections) > budget {
        sections.remove(0);
    }

    render(&sections)
}

struct Section {
    header: String,
    body: String,
}

fn split_sections(doc: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<Section> = None;

    for line in doc.lines() {
        if line.starts_with("## Iteration ") {
            if let Some(section) = current.take() {
                sections.push(section);
            }
            current = Some(Section {
                header: line.to_string(),
                body: String::new(),
            });
        } else if let Some(section) = current.as_mut() {
            if !section.body.is_empty() {
                section.body.push('\n');
            }
            section.body.push_str(line);
        }
        // Preamble text before the first header is discarded.
    }
    if let Some(section) = current.take() {
        sections.push(section);
    }

    for s in &mut sections {
        s.body = s.body.trim().to_string();
    }
    sections
}

fn rendered_len(sections: &[Section]) -> usize {
    render(sections).chars().count()
}

fn render(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| format!("{}\n\n{}", s.header, s.body))
        .collect::<Vec<_>>()
        .join("\n\n")
}
