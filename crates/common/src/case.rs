//! Declarative YAML test cases

use crate::types::TestCase;
use crate::{Error, Result};
use std::path::Path;

impl TestCase {
    /// Parse a test case from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let case: Self = serde_yaml::from_str(yaml)?;
        case.validate()?;
        Ok(case)
    }

    /// Parse a test case from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load all test cases from a directory
    pub fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut cases = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            cases.push(Self::from_file(entry.path())?);
        }

        Ok(cases)
    }

    /// Filter cases by tag
    pub fn filter_by_tag<'a>(cases: &'a [Self], tag: &str) -> Vec<&'a Self> {
        cases.iter().filter(|c| c.tags.iter().any(|t| t == tag)).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("test case id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "test case {} has no steps",
                self.id
            )));
        }
        if let Some(i) = self.steps.iter().position(|s| s.target.trim().is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "test case {} step {} has an empty target",
                self.id,
                i + 1
            )));
        }
        Ok(())
    }
}
