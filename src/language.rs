use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::EngineError;

/// Languages the sandbox knows how to build and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
}

/// Static build/run recipe for one language
///
/// Commands refer to fixed paths inside the sandbox: sources are mounted under
/// [`SOURCE_DIR`] and build output goes to [`BUILD_DIR`].
#[derive(Debug, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    pub tag: &'static str,
    pub source_extension: &'static str,
    /// File name the source must carry inside the sandbox
    pub source_name: &'static str,
    /// Whether the host-side file must also use `source_name` (Java public class rule)
    pub fixed_entry_name: bool,
    pub compile_command: Option<&'static [&'static str]>,
    pub run_command: &'static [&'static str],
    /// Main compiled artifact written to the build directory
    pub artifact_name: Option<&'static str>,
}

pub const SOURCE_DIR: &str = "/sandbox/src";
pub const BUILD_DIR: &str = "/sandbox/build";

static CPP: LanguageProfile = LanguageProfile {
    language: Language::Cpp,
    tag: "cpp",
    source_extension: "cpp",
    source_name: "solution.cpp",
    fixed_entry_name: false,
    compile_command: Some(&[
        "g++",
        "-std=c++17",
        "-O2",
        "-pipe",
        "-o",
        "/sandbox/build/solution",
        "/sandbox/src/solution.cpp",
    ]),
    run_command: &["/sandbox/build/solution"],
    artifact_name: Some("solution"),
};

static JAVA: LanguageProfile = LanguageProfile {
    language: Language::Java,
    tag: "java",
    source_extension: "java",
    source_name: "Solution.java",
    fixed_entry_name: true,
    compile_command: Some(&[
        "javac",
        "-encoding",
        "UTF-8",
        "-d",
        "/sandbox/build",
        "/sandbox/src/Solution.java",
    ]),
    run_command: &["java", "-XX:+UseSerialGC", "-cp", "/sandbox/build", "Solution"],
    artifact_name: Some("Solution.class"),
};

static PYTHON: LanguageProfile = LanguageProfile {
    language: Language::Python,
    tag: "python",
    source_extension: "py",
    source_name: "solution.py",
    fixed_entry_name: false,
    compile_command: None,
    run_command: &["python3", "/sandbox/src/solution.py"],
    artifact_name: None,
};

impl Language {
    pub const ALL: [Language; 3] = [Language::Cpp, Language::Java, Language::Python];

    pub fn profile(self) -> &'static LanguageProfile {
        match self {
            Language::Cpp => &CPP,
            Language::Java => &JAVA,
            Language::Python => &PYTHON,
        }
    }
}

impl LanguageProfile {
    pub fn needs_compilation(&self) -> bool {
        self.compile_command.is_some()
    }
}

/// Looks up the profile for a caller-supplied language tag
pub fn resolve(tag: &str) -> Result<&'static LanguageProfile, EngineError> {
    tag.parse::<Language>().map(Language::profile)
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "python" | "python3" | "py" => Ok(Language::Python),
            _ => Err(EngineError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_tags() {
        assert_eq!(resolve("cpp").unwrap().language, Language::Cpp);
        assert_eq!(resolve("C++").unwrap().language, Language::Cpp);
        assert_eq!(resolve("java").unwrap().language, Language::Java);
        assert_eq!(resolve(" Python3 ").unwrap().language, Language::Python);
    }

    #[test]
    fn test_resolve_unknown_tag() {
        match resolve("brainfuck") {
            Err(EngineError::UnsupportedLanguage(tag)) => assert_eq!(tag, "brainfuck"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_compilation_requirements() {
        assert!(Language::Cpp.profile().needs_compilation());
        assert!(Language::Java.profile().needs_compilation());
        assert!(!Language::Python.profile().needs_compilation());
        assert!(Language::Python.profile().artifact_name.is_none());
    }

    #[test]
    fn test_commands_use_sandbox_paths() {
        for language in Language::ALL {
            let profile = language.profile();
            assert!(profile.source_name.ends_with(profile.source_extension));
            if let Some(compile) = profile.compile_command {
                let source = format!("{SOURCE_DIR}/{}", profile.source_name);
                assert!(compile.contains(&source.as_str()), "{language} compiles {source}");
                assert!(compile.iter().any(|arg| arg.starts_with(BUILD_DIR)));
            }
        }
    }

    #[test]
    fn test_java_entry_point_is_canonical() {
        let java = Language::Java.profile();
        assert!(java.fixed_entry_name);
        assert_eq!(java.source_name, "Solution.java");
        assert_eq!(java.run_command.last(), Some(&"Solution"));
    }

    #[test]
    fn test_display_round_trips_tag() {
        for language in Language::ALL {
            assert_eq!(language.to_string().parse::<Language>().unwrap(), language);
        }
    }
}
