//! End-to-end runs against a real container engine with the default images pulled.
//!
//! Run with `cargo test --test container_tests -- --ignored`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use codejudge::config::{JudgeConfig, SandboxConfig};
use codejudge::judge::{Engine, ExecutionRequest, Problem, TestCase};
use codejudge::sandbox::ContainerRunner;
use codejudge::workspace::WorkspaceManager;

fn engine(root: &std::path::Path, time_limit: Duration) -> Engine {
    let config = SandboxConfig {
        time_limit_ms: time_limit.as_millis() as u64,
        ..Default::default()
    };
    Engine::new(
        Arc::new(ContainerRunner::new(config)),
        WorkspaceManager::new(root).unwrap(),
        JudgeConfig::default(),
        time_limit,
    )
}

fn request(language: &str, source_code: &str, cases: &[(&str, &str)]) -> ExecutionRequest {
    ExecutionRequest {
        source_code: source_code.to_string(),
        language: language.to_string(),
        problem: Problem {
            test_cases: Some(
                cases
                    .iter()
                    .map(|&(input, output)| TestCase::new(input, output))
                    .collect(),
            ),
            ..Default::default()
        },
    }
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_python_echo() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Duration::from_secs(10));

    let result = engine
        .execute(&request("python", "print(input())", &[("42", "42")]))
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.test_results.len(), 1);
    assert!(result.test_results[0].passed);
    assert_eq!(result.test_results[0].actual_output, "42");
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_echo_in_every_language() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Duration::from_secs(10));
    let programs = [
        (
            "cpp",
            "#include <iostream>\n#include <string>\nint main() { std::string s; std::getline(std::cin, s); std::cout << s << std::endl; }",
        ),
        (
            "java",
            "import java.util.Scanner;\npublic class Solution { public static void main(String[] a) { System.out.println(new Scanner(System.in).nextLine()); } }",
        ),
        ("python", "print(input())"),
    ];

    for (language, source) in programs {
        let result = engine
            .execute(&request(language, source, &[("hello judge", "hello judge")]))
            .await
            .unwrap();
        assert!(result.success(), "{language}: {result:?}");
        assert_eq!(result.test_results.len(), 1);
    }
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_cpp_syntax_error() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Duration::from_secs(10));

    let result = engine
        .execute(&request("cpp", "int main(){", &[("", "")]))
        .await
        .unwrap();

    assert!(!result.success());
    assert!(!result.compilation_error.unwrap_or_default().is_empty());
    assert!(result.test_results.is_empty());
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn test_infinite_loop_is_killed() {
    let root = tempfile::tempdir().unwrap();
    let limit = Duration::from_secs(2);
    let engine = engine(root.path(), limit);

    let started = Instant::now();
    let result = engine
        .execute(&request("python", "while True:\n    pass", &[("", "1")]))
        .await
        .unwrap();

    assert_eq!(result.test_results.len(), 1);
    assert!(!result.test_results[0].passed);
    assert_eq!(result.test_results[0].execution_time_ms, 2000);
    assert!(started.elapsed() < limit + Duration::from_secs(10));
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}
