/// Help text split into lines, with the paragraph helpers the parsers share.
#[derive(Debug)]
pub struct PreparedText {
    pub lines: Vec<String>,
}

impl PreparedText {
    pub fn new(text: &str) -> PreparedText {
        PreparedText {
            lines: text.lines().map(String::from).collect(),
        }
    }

    /// Index of the first line whose trimmed text satisfies the predicate.
    pub fn find_line(&self, start: usize, pred: impl Fn(&str) -> bool) -> Option<usize> {
        (start..self.lines.len()).find(|&idx| pred(&self.lines[idx]))
    }

    /// First blank line at or after `start`, or one past the end.
    pub fn paragraph_end(&self, start: usize) -> usize {
        (start..self.lines.len())
            .find(|&idx| self.lines[idx].trim().is_empty())
            .unwrap_or(self.lines.len())
    }
}

/// Leading-whitespace width of a line; blank lines have no indent.
pub fn compute_indent(line: &str) -> i64 {
    let mut indent = 0;
    for c in line.chars() {
        if c.is_whitespace() {
            indent += 1;
        } else {
            return indent;
        }
    }
    -1
}

/// A line and the more-indented lines nested below it.
#[derive(Debug)]
pub struct LineTree {
    pub line: String,
    pub children: Vec<LineTree>,
    /// One past the last line covered by this tree.
    pub line_end: usize,
}

impl PreparedText {
    /// Find the next line matching `pred` and collect the indentation tree
    /// hanging off it.
    pub fn find_indented_paragraph(
        &self,
        pred: impl Fn(&str) -> bool,
        start_line: usize,
    ) -> Option<LineTree> {
        let head = self.find_line(start_line, pred)?;
        let mut cur = head;
        Some(self.extract_tree(&mut cur))
    }

    fn extract_tree(&self, cur: &mut usize) -> LineTree {
        let start = *cur;
        let start_indent = compute_indent(&self.lines[start]);
        let mut children = Vec::new();
        *cur += 1;
        while *cur < self.lines.len() {
            let cur_indent = compute_indent(&self.lines[*cur]);
            if cur_indent > start_indent {
                children.push(self.extract_tree(cur));
            } else {
                break;
            }
        }
        LineTree {
            line: self.lines[start].clone(),
            children,
            line_end: *cur,
        }
    }
}
