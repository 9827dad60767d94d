use crate::config::OutputMatch;

/// Decides whether a program's stdout answers a test case
pub fn outputs_match(mode: OutputMatch, program_output: &str, expected_output: &str) -> bool {
    match mode {
        OutputMatch::Trim => compare_output_trim(program_output, expected_output),
        OutputMatch::Lines => compare_output_lines(program_output, expected_output),
        OutputMatch::Strict => compare_output_strict(program_output, expected_output),
    }
}

/// Exact equality once leading and trailing whitespace is removed
///
/// Whitespace inside the output is significant.
#[inline]
fn compare_output_trim(program_output: &str, expected_output: &str) -> bool {
    program_output.trim() == expected_output.trim()
}

/// Compares program output with expected output line by line
///
/// Ignores trailing spaces on each line, trailing empty lines and the difference
/// between `\r\n` and `\n`.
fn compare_output_lines(program_output: &str, expected_output: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string()
    };

    normalize(program_output) == normalize(expected_output)
}

#[inline]
fn compare_output_strict(program_output: &str, expected_output: &str) -> bool {
    program_output == expected_output
}
