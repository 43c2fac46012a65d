//! Outbound actions performed on behalf of a selected account.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, instrument},
};

use crate::{
    error::{AccountError, Result},
    manager::AccountManager,
    registry::AccountSession,
};

/// Conversation kind a thread id refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadType {
    #[default]
    User,
    Group,
}

/// A request run through an account's live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AccountAction {
    SendMessage {
        thread_id: String,
        #[serde(default)]
        thread_type: ThreadType,
        text: String,
    },
    /// Images are fetched by the session from the given URLs.
    SendImages {
        thread_id: String,
        #[serde(default)]
        thread_type: ThreadType,
        image_urls: Vec<String>,
    },
    FindUser {
        phone: String,
    },
    GetUserInfo {
        user_id: String,
    },
    SendFriendRequest {
        user_id: String,
        message: String,
    },
    CreateGroup {
        name: String,
        members: Vec<String>,
    },
    GetGroupInfo {
        group_id: String,
    },
    AddGroupMember {
        group_id: String,
        member_id: String,
    },
    RemoveGroupMember {
        group_id: String,
        member_id: String,
    },
    ListGroups,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AccountError::InvalidAction(format!("{field} is required")));
    }
    Ok(())
}

impl AccountAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::SendImages { .. } => "send_images",
            Self::FindUser { .. } => "find_user",
            Self::GetUserInfo { .. } => "get_user_info",
            Self::SendFriendRequest { .. } => "send_friend_request",
            Self::CreateGroup { .. } => "create_group",
            Self::GetGroupInfo { .. } => "get_group_info",
            Self::AddGroupMember { .. } => "add_group_member",
            Self::RemoveGroupMember { .. } => "remove_group_member",
            Self::ListGroups => "list_groups",
        }
    }

    /// Reject actions with missing required fields before they reach the
    /// platform.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SendMessage {
                thread_id, text, ..
            } => {
                require("threadId", thread_id)?;
                require("text", text)
            },
            Self::SendImages {
                thread_id,
                image_urls,
                ..
            } => {
                require("threadId", thread_id)?;
                if image_urls.is_empty() {
                    return Err(AccountError::InvalidAction("imageUrls is required".into()));
                }
                image_urls.iter().try_for_each(|u| require("imageUrls", u))
            },
            Self::FindUser { phone } => require("phone", phone),
            Self::GetUserInfo { user_id } | Self::SendFriendRequest { user_id, .. } => {
                require("userId", user_id)
            },
            Self::CreateGroup { name, members } => {
                require("name", name)?;
                if members.is_empty() {
                    return Err(AccountError::InvalidAction("members is required".into()));
                }
                Ok(())
            },
            Self::GetGroupInfo { group_id } => require("groupId", group_id),
            Self::AddGroupMember {
                group_id,
                member_id,
            }
            | Self::RemoveGroupMember {
                group_id,
                member_id,
            } => {
                require("groupId", group_id)?;
                require("memberId", member_id)
            },
            Self::ListGroups => Ok(()),
        }
    }
}

/// Account an action ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedAccount {
    pub own_id: String,
    pub phone_number: Option<String>,
}

/// Platform reply to an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub data: Value,
    pub used_account: UsedAccount,
}

impl AccountManager {
    /// Resolve an account by id, then by phone number.
    pub fn select_account(&self, selection: &str) -> Result<AccountSession> {
        let selection = selection.trim();
        if selection.is_empty() {
            return Err(AccountError::NoAccountSelected);
        }
        let registry = self.registry();
        registry
            .get(selection)
            .or_else(|| registry.find_by_phone(selection))
            .ok_or_else(|| AccountError::AccountNotFound(selection.to_string()))
    }

    /// Run `action` through the session of the selected account.
    #[instrument(skip(self, action), fields(action = action.name()))]
    pub async fn perform_action(
        &self,
        selection: &str,
        action: AccountAction,
    ) -> Result<ActionOutcome> {
        if self.is_shut_down() {
            return Err(AccountError::ShutDown);
        }
        action.validate()?;
        let session = self.select_account(selection)?;
        debug!(own_id = %session.own_id, "performing account action");
        let data = session.handle.perform(&action).await?;
        Ok(ActionOutcome {
            data,
            used_account: UsedAccount {
                own_id: session.own_id,
                phone_number: session.phone_number,
            },
        })
    }
}
