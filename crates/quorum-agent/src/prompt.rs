use quorum_core::agent::ReviewRequest;

const MAX_DIFF_CHARS: usize = 200_000;

/// Build the review instruction handed to every reviewer backend.
///
/// Each reviewer sees only the diff, the file list and its own focus
/// category, never another reviewer's output.
pub fn build_review_prompt(request: &ReviewRequest) -> String {
    let mut s = String::new();

    s.push_str(&format!(
        "You are an independent code reviewer focused on {}.\n\
         Review the change below and report only problems within your focus.\n\n",
        request.reviewer_category
    ));

    if !request.files.is_empty() {
        s.push_str("Files changed:\n");
        for f in &request.files {
            s.push_str(&format!("- {f}\n"));
        }
        s.push('\n');
    }

    s.push_str("```diff\n");
    s.push_str(truncate(&request.diff, MAX_DIFF_CHARS));
    if !request.diff.ends_with('\n') {
        s.push('\n');
    }
    s.push_str("```\n\n");

    s.push_str(
        "Respond with a JSON array and nothing else. Each element must have:\n\
         - \"severity\": integer 0-10\n\
         - \"confidence\": integer 0-100\n\
         - \"category\": short lowercase label\n\
         - \"file\": path as listed above\n\
         - \"line\": line number in the new file\n\
         - \"description\": what is wrong\n\
         - \"remediation\": how to fix it\n\
         Return [] if you find nothing.\n",
    );
    s
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
