//! Interactive prompting.
//!
//! Every question dray asks goes through the [`Prompter`] trait so the
//! engine and the initialization gates stay testable; the terminal
//! implementation is a thin layer over [`dialoguer`].

use anyhow::{Context, Result, bail};
use dialoguer::{Confirm, MultiSelect, Select};

/// Interactive questions asked during a deployment.
pub trait Prompter: Send + Sync {
    /// Yes/no question with a default answer.
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;

    /// Pick exactly one of `options`.
    fn select_one(&self, message: &str, options: &[String]) -> Result<String>;

    /// Pick any subset of `options`.
    fn select_many(&self, message: &str, options: &[String]) -> Result<Vec<String>>;
}

/// [`Prompter`] backed by the user's terminal.
pub struct TermPrompter;

impl Prompter for TermPrompter {
    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        Confirm::new()
            .with_prompt(message)
            .default(default)
            .interact()
            .context("Failed to read confirmation")
    }

    fn select_one(&self, message: &str, options: &[String]) -> Result<String> {
        if options.is_empty() {
            bail!("nothing to select from");
        }
        let index = Select::new()
            .with_prompt(message)
            .items(options)
            .default(0)
            .interact()
            .context("Failed to read selection")?;
        Ok(options[index].clone())
    }

    fn select_many(&self, message: &str, options: &[String]) -> Result<Vec<String>> {
        if options.is_empty() {
            bail!("nothing to select from");
        }
        let indices = MultiSelect::new()
            .with_prompt(message)
            .items(options)
            .interact()
            .context("Failed to read selection")?;
        Ok(indices.into_iter().map(|i| options[i].clone()).collect())
    }
}
