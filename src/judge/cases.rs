use super::{Problem, TestCase};
use crate::error::EngineError;

/// Where the judged cases came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSource {
    /// Supplied by the problem author
    Explicit,
    /// Only the sample input/output pair
    Sample,
    /// Sample pair plus cases guessed from the problem title
    Heuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCases {
    pub cases: Vec<TestCase>,
    pub source: CaseSource,
}

/// Picks the test cases to judge a problem against
///
/// Explicit cases always win. Without them the sample pair is used, and keyword
/// heuristics are added only when `heuristic_fallback` is on. Anything that is not
/// author-provided is logged so it can be told apart from real judge content.
pub fn resolve(problem: &Problem, heuristic_fallback: bool) -> Result<ResolvedCases, EngineError> {
    if let Some(cases) = &problem.test_cases
        && !cases.is_empty()
    {
        return Ok(ResolvedCases {
            cases: cases.clone(),
            source: CaseSource::Explicit,
        });
    }

    let title = problem.title.as_deref().unwrap_or_default();
    let mut cases = Vec::new();
    if let (Some(input), Some(output)) = (&problem.sample_input, &problem.sample_output)
        && !output.trim().is_empty()
    {
        cases.push(TestCase::new(input, output));
    }

    let source = if heuristic_fallback {
        let guessed = heuristic_cases(title);
        log::warn!(
            "Problem {title:?} has no explicit test cases, synthesized {} heuristic case(s)",
            guessed.len()
        );
        cases.extend(guessed);
        CaseSource::Heuristic
    } else {
        if !cases.is_empty() {
            log::info!("Problem {title:?} has no explicit test cases, judging the sample pair");
        }
        CaseSource::Sample
    };

    if cases.is_empty() {
        return Err(EngineError::NoTestCases {
            title: title.to_string(),
        });
    }

    Ok(ResolvedCases { cases, source })
}

/// Canned cases keyed on words in the problem title
fn heuristic_cases(title: &str) -> Vec<TestCase> {
    let title = title.to_lowercase();
    let table: &[(&str, &str)] = if title.contains("sum") {
        &[("1 2", "3"), ("5 7", "12"), ("0 0", "0"), ("-1 1", "0")]
    } else if title.contains("hello") {
        &[("", "Hello World")]
    } else if title.contains("fibonacci") {
        &[("0", "0"), ("1", "1"), ("5", "5"), ("10", "55")]
    } else if title.contains("factorial") {
        &[("0", "1"), ("1", "1"), ("5", "120")]
    } else {
        &[("1", "1"), ("2", "2")]
    };

    table
        .iter()
        .map(|&(input, output)| TestCase::new(input, output))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn problem(title: &str) -> Problem {
        Problem {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_cases_win() {
        let problem = Problem {
            test_cases: Some(vec![TestCase::new("1", "1")]),
            sample_input: Some("9".into()),
            sample_output: Some("9".into()),
            ..problem("Sum of two")
        };
        let resolved = resolve(&problem, true).unwrap();
        assert_eq!(resolved.source, CaseSource::Explicit);
        assert_eq!(resolved.cases, vec![TestCase::new("1", "1")]);
    }

    #[test]
    fn test_sample_pair_without_heuristics() {
        let problem = Problem {
            test_cases: Some(Vec::new()),
            sample_input: Some("2 3".into()),
            sample_output: Some("5".into()),
            ..problem("Sum of two")
        };
        let resolved = resolve(&problem, false).unwrap();
        assert_eq!(resolved.source, CaseSource::Sample);
        assert_eq!(resolved.cases, vec![TestCase::new("2 3", "5")]);
    }

    #[test]
    fn test_heuristics_extend_sample() {
        let problem = Problem {
            sample_input: Some("2 3".into()),
            sample_output: Some("5".into()),
            ..problem("Two Sum")
        };
        let resolved = resolve(&problem, true).unwrap();
        assert_eq!(resolved.source, CaseSource::Heuristic);
        assert_eq!(resolved.cases.len(), 5);
        assert_eq!(resolved.cases[0], TestCase::new("2 3", "5"));
        assert_eq!(resolved.cases[1], TestCase::new("1 2", "3"));
    }

    #[test]
    fn test_heuristic_keywords() {
        assert_eq!(heuristic_cases("FIBONACCI numbers")[3], TestCase::new("10", "55"));
        assert_eq!(heuristic_cases("Factorial")[2], TestCase::new("5", "120"));
        assert_eq!(heuristic_cases("hello world"), vec![TestCase::new("", "Hello World")]);
        assert_eq!(heuristic_cases("Graph coloring").len(), 2);
    }

    #[test]
    fn test_nothing_to_judge() {
        match resolve(&problem("Mystery"), false) {
            Err(EngineError::NoTestCases { title }) => assert_eq!(title, "Mystery"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_blank_sample_output_is_ignored() {
        let problem = Problem {
            sample_input: Some("1".into()),
            sample_output: Some("   ".into()),
            ..problem("Echo")
        };
        assert!(resolve(&problem, false).is_err());
    }
}
