//! First-start bootstrap of a fresh deployment: one account, its default roles
//! and user groups, and the admin user.

use std::fmt;

use chrono::Utc;
use db::{Document, DocumentStore, Filter};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{error::MigrationError, identifier::IdGenerator, ledger::to_document};

pub const ACCOUNTS: &str = "accounts";
pub const ROLES: &str = "roles";
pub const USER_GROUPS: &str = "userGroups";
pub const USERS: &str = "users";

/// Roles and user groups are account-wide, not tied to an application.
pub const GLOBAL_APP_ID: &str = "__GLOBAL_APP_ID__";

/// Operator-supplied values for the seed bundle, read from configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedTemplate {
    #[serde(alias = "accountId")]
    pub account_id: Option<String>,
    #[serde(alias = "companyName")]
    pub company_name: Option<String>,
    #[serde(alias = "accountName")]
    pub account_name: Option<String>,
    #[serde(alias = "adminEmail")]
    pub admin_email: Option<String>,
    #[serde(alias = "adminName")]
    pub admin_name: Option<String>,
    #[serde(alias = "accountSecret")]
    pub account_secret: Option<String>,
}

impl fmt::Debug for SeedTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedTemplate")
            .field("account_id", &self.account_id)
            .field("company_name", &self.company_name)
            .field("account_name", &self.account_name)
            .field("admin_email", &self.admin_email)
            .field("admin_name", &self.admin_name)
            .field(
                "account_secret",
                &self.account_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// A template with every required value present.
#[derive(Debug)]
pub struct ValidatedTemplate {
    pub account_id: String,
    pub company_name: String,
    pub account_name: String,
    pub admin_email: String,
    pub admin_name: String,
    pub account_secret: SecretString,
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl SeedTemplate {
    /// Reports every missing value at once so the operator can fix the
    /// configuration in a single pass.
    pub fn validate(&self) -> Result<ValidatedTemplate, MigrationError> {
        let required = [
            ("account_id", present(&self.account_id)),
            ("company_name", present(&self.company_name)),
            ("account_name", present(&self.account_name)),
            ("admin_email", present(&self.admin_email)),
            ("account_secret", present(&self.account_secret)),
        ];
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect();

        match required {
            [
                (_, Some(account_id)),
                (_, Some(company_name)),
                (_, Some(account_name)),
                (_, Some(admin_email)),
                (_, Some(account_secret)),
            ] => {
                let admin_name = present(&self.admin_name).unwrap_or_else(|| admin_email.clone());
                Ok(ValidatedTemplate {
                    account_id,
                    company_name,
                    account_name,
                    admin_email,
                    admin_name,
                    account_secret: SecretString::from(account_secret),
                })
            }
            _ => Err(MigrationError::TemplateIncomplete { missing }),
        }
    }
}

/// Primary keys of the seeded records other than the account. Generated once
/// per environment and persisted; reusing a set for a second environment
/// collides on these keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedIds {
    pub account_admin_role_id: String,
    pub application_admin_role_id: String,
    pub account_admin_group_id: String,
    pub production_support_group_id: String,
    pub non_production_support_group_id: String,
    pub admin_user_id: String,
}

impl SeedIds {
    pub fn generate(ids: &IdGenerator) -> Self {
        Self {
            account_admin_role_id: ids.new_id(),
            application_admin_role_id: ids.new_id(),
            account_admin_group_id: ids.new_id(),
            production_support_group_id: ids.new_id(),
            non_production_support_group_id: ids.new_id(),
            admin_user_id: ids.new_id(),
        }
    }
}

/// The records of one bootstrap, in write order. The account comes last: it is
/// what the guard counts, so it must only exist once everything else does.
#[derive(Debug)]
pub struct SeedBundle {
    pub records: Vec<(&'static str, Document)>,
}

pub fn build_seed_bundle(
    template: &ValidatedTemplate,
    ids: &SeedIds,
) -> Result<SeedBundle, MigrationError> {
    let now = Utc::now().timestamp_millis();
    let account_id = template.account_id.as_str();

    let role = |id: &str, name: &str, role_type: &str| {
        json!({
            "_id": id,
            "accountId": account_id,
            "appId": GLOBAL_APP_ID,
            "name": name,
            "roleType": role_type,
            "allApps": true,
            "createdAt": now,
            "lastUpdatedAt": now,
        })
    };
    let group = |id: &str, name: &str, description: &str, members: Vec<&str>, roles: Vec<&str>| {
        json!({
            "_id": id,
            "accountId": account_id,
            "appId": GLOBAL_APP_ID,
            "name": name,
            "description": description,
            "memberIds": members,
            "roleIds": roles,
            "isDefault": true,
            "createdAt": now,
            "lastUpdatedAt": now,
        })
    };

    let values = [
        (
            ROLES,
            role(&ids.account_admin_role_id, "Account Administrator", "ACCOUNT_ADMIN"),
        ),
        (
            ROLES,
            role(
                &ids.application_admin_role_id,
                "Application Administrator",
                "APPLICATION_ADMIN",
            ),
        ),
        (
            USER_GROUPS,
            group(
                &ids.account_admin_group_id,
                "Account Administrator",
                "Default account admin user group",
                vec![ids.admin_user_id.as_str()],
                vec![ids.account_admin_role_id.as_str()],
            ),
        ),
        (
            USER_GROUPS,
            group(
                &ids.production_support_group_id,
                "Production Support",
                "Production support members have access to override configuration, setup infrastructure and setup/execute deployment workflows within PROD environments",
                Vec::new(),
                vec![ids.application_admin_role_id.as_str()],
            ),
        ),
        (
            USER_GROUPS,
            group(
                &ids.non_production_support_group_id,
                "Non-Production Support",
                "Non-production support members have access to override configuration, setup infrastructure and setup/execute deployment workflows within NON_PROD environments",
                Vec::new(),
                vec![ids.application_admin_role_id.as_str()],
            ),
        ),
        (
            USERS,
            json!({
                "_id": ids.admin_user_id,
                "email": template.admin_email,
                "name": template.admin_name,
                "accountIds": [account_id],
                "roleIds": [ids.account_admin_role_id, ids.application_admin_role_id],
                "userGroupIds": [ids.account_admin_group_id],
                "defaultAccountId": account_id,
                "emailVerified": true,
                "createdAt": now,
                "lastUpdatedAt": now,
            }),
        ),
        (
            ACCOUNTS,
            json!({
                "_id": account_id,
                "companyName": template.company_name,
                "accountName": template.account_name,
                "accountKey": template.account_secret.expose_secret(),
                "createdAt": now,
                "lastUpdatedAt": now,
            }),
        ),
    ];

    let records = values
        .iter()
        .map(|(collection, value)| to_document(value).map(|document| (*collection, document)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SeedBundle { records })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SeedOutcome {
    Seeded {
        account_id: String,
        inserted: usize,
        /// Records left behind by an earlier, interrupted seed.
        already_present: usize,
    },
    AlreadySeeded {
        accounts: u64,
    },
}

/// Writes the seed bundle unless an account already exists. Safe to call on
/// every start. Validation happens before any write.
pub async fn seed_if_empty(
    store: &dyn DocumentStore,
    template: &SeedTemplate,
    ids: &SeedIds,
) -> Result<SeedOutcome, MigrationError> {
    let template = template.validate()?;

    let accounts = store.count(ACCOUNTS, &Filter::new()).await?;
    if accounts > 0 {
        tracing::info!(accounts, "Accounts present; skipping seed");
        return Ok(SeedOutcome::AlreadySeeded { accounts });
    }

    let bundle = build_seed_bundle(&template, ids)?;
    let mut inserted = 0;
    let mut already_present = 0;
    for (collection, document) in bundle.records {
        match store.insert_one(collection, document).await {
            Ok(()) => inserted += 1,
            Err(err) if err.is_duplicate_key() => {
                tracing::debug!(collection, "Seed record already present");
                already_present += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    tracing::info!(
        account_id = %template.account_id,
        inserted,
        already_present,
        "Seeded initial account"
    );
    Ok(SeedOutcome::Seeded {
        account_id: template.account_id,
        inserted,
        already_present,
    })
}
