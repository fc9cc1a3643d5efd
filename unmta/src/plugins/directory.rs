//! The employee directory plugin.
//!
//! The worked example of the plugin API: refuses mail for people who are no
//! longer in the directory. Configure with
//!
//! ```toml
//! [plugins.employee_directory]
//! former = ["milton.waddams"]
//! ```
//!
//! Entries match the recipient's local part, or the whole address when they
//! contain an `@`. Matching is case-insensitive.

use async_trait::async_trait;
use unmta_common::address::EnvelopeAddress;
use unmta_smtp::{HookResult, Plugin, PluginView, Response, SmtpCommand};

pub struct EmployeeDirectory {
    former: Vec<String>,
}

impl EmployeeDirectory {
    #[must_use]
    pub fn new(former: Vec<String>) -> Self {
        Self {
            former: former.into_iter().map(|f| f.to_ascii_lowercase()).collect(),
        }
    }

    /// Build from the plugin's Unfig table.
    #[must_use]
    pub fn from_config(table: &toml::Table) -> Self {
        let former = table
            .get("former")
            .and_then(toml::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(toml::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self::new(former)
    }

    fn is_former(&self, recipient: &EnvelopeAddress) -> bool {
        let local = recipient.local_part().to_ascii_lowercase();
        let address = recipient.address().to_ascii_lowercase();

        self.former.iter().any(|entry| {
            if entry.contains('@') {
                *entry == address
            } else {
                *entry == local
            }
        })
    }
}

impl Default for EmployeeDirectory {
    fn default() -> Self {
        Self::new(vec!["milton.waddams".to_string()])
    }
}

#[async_trait]
impl Plugin for EmployeeDirectory {
    fn plugin_name(&self) -> &str {
        "employee_directory"
    }

    async fn on_rcpt_to(
        &self,
        session: &mut PluginView<'_>,
        recipient: &EnvelopeAddress,
        _command: &SmtpCommand,
    ) -> HookResult {
        let checked = session
            .get_own_plugin_data::<u32>("checked")
            .copied()
            .unwrap_or(0);
        session.set_own_plugin_data("checked", checked + 1);

        if self.is_former(recipient) {
            return Ok(Some(Response::raw(
                421,
                "Yeah, we can't actually find a record of him being a current employee here",
            )?));
        }

        Ok(None)
    }
}
