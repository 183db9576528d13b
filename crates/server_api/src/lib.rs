use shared::{
    domain::{GroupId, MessageId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatFrame, FileInfo, GroupDetail, GroupSummary, MembershipInfo, MessageBody, MessagePage,
        MessageRecord, RelayAck, RelayBatch, RelayEvent, SenderInfo,
    },
};
use storage::{GroupRow, MembershipRow, Storage, StoredAttachment, StoredMessage};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Attachment reference supplied by a caller. Image-ness is decided here,
/// once, from the declared type; readers never re-inspect the file.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub url: String,
    pub filename: String,
    pub mime_type: Option<String>,
}

impl NewAttachment {
    fn into_stored(self) -> StoredAttachment {
        let is_image = self
            .mime_type
            .as_deref()
            .map(|mime| mime.starts_with("image/"))
            .unwrap_or(false);
        StoredAttachment {
            url: self.url,
            filename: self.filename,
            mime_type: self.mime_type,
            is_image,
        }
    }
}

pub async fn resolve_group(ctx: &ApiContext, slug: &str) -> Result<GroupRow, ApiError> {
    ctx.storage
        .group_by_slug(slug)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("chat group '{slug}' does not exist")))
}

/// The single authorization primitive: always re-queries current membership.
async fn ensure_member(ctx: &ApiContext, group: &GroupRow, user_id: UserId) -> Result<(), ApiError> {
    let member = ctx
        .storage
        .is_member(group.group_id, user_id)
        .await
        .map_err(internal)?;
    if member {
        Ok(())
    } else {
        Err(ApiError::forbidden("user is not a member of this group"))
    }
}

pub async fn create_public_group(
    ctx: &ApiContext,
    display_name: Option<&str>,
    member_emails: &[String],
) -> Result<GroupDetail, ApiError> {
    let members = resolve_members(ctx, member_emails).await?;
    let group = ctx
        .storage
        .create_public_group(display_name)
        .await
        .map_err(internal)?;
    for user in &members {
        ctx.storage
            .insert_membership(group.group_id, *user, Role::Member)
            .await
            .map_err(internal)?;
    }
    group_detail_of(ctx, group).await
}

/// Idempotent private-group creation: an existing private group with the
/// exact same member set is reused instead of duplicated.
pub async fn create_or_reuse_private_group(
    ctx: &ApiContext,
    member_emails: &[String],
) -> Result<(GroupDetail, bool), ApiError> {
    if member_emails.len() < 2 {
        return Err(ApiError::validation(
            "at least two members are required for a private chat",
        ));
    }
    let mut members = resolve_members(ctx, member_emails).await?;
    members.sort_unstable_by_key(|id| id.0);
    members.dedup();

    if let Some(existing) = ctx
        .storage
        .find_private_group_by_members(&members)
        .await
        .map_err(internal)?
    {
        let detail = group_detail_of(ctx, existing).await?;
        return Ok((detail, true));
    }

    let group = ctx
        .storage
        .create_private_group(&members)
        .await
        .map_err(internal)?;
    let detail = group_detail_of(ctx, group).await?;
    Ok((detail, false))
}

async fn resolve_members(ctx: &ApiContext, member_emails: &[String]) -> Result<Vec<UserId>, ApiError> {
    let mut members = Vec::with_capacity(member_emails.len());
    for email in member_emails {
        let user = ctx
            .storage
            .user_by_email(email)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                ApiError::validation(format!("user with email {email} does not exist"))
            })?;
        members.push(user.user_id);
    }
    Ok(members)
}

pub async fn list_groups(
    ctx: &ApiContext,
    user_id: UserId,
    search: Option<&str>,
) -> Result<Vec<GroupSummary>, ApiError> {
    let groups = ctx
        .storage
        .list_groups_for_user(user_id, search)
        .await
        .map_err(internal)?;
    Ok(groups
        .into_iter()
        .map(|g| GroupSummary {
            group_name: g.group.slug,
            groupchat_name: g.group.display_name,
            is_private: g.group.is_private,
            last_message_content: g.last_message_content,
            last_message_time: g.last_message_time,
            last_message_sender: g.last_message_sender,
        })
        .collect())
}

pub async fn group_detail(
    ctx: &ApiContext,
    user_id: UserId,
    slug: &str,
) -> Result<GroupDetail, ApiError> {
    let group = resolve_group(ctx, slug).await?;
    ensure_member(ctx, &group, user_id).await?;
    group_detail_of(ctx, group).await
}

pub async fn update_group(
    ctx: &ApiContext,
    user_id: UserId,
    slug: &str,
    display_name: Option<&str>,
    is_private: Option<bool>,
) -> Result<GroupDetail, ApiError> {
    let group = resolve_group(ctx, slug).await?;
    ensure_member(ctx, &group, user_id).await?;
    ctx.storage
        .update_group(group.group_id, display_name, is_private)
        .await
        .map_err(internal)?;
    let refreshed = resolve_group(ctx, slug).await?;
    group_detail_of(ctx, refreshed).await
}

async fn group_detail_of(ctx: &ApiContext, group: GroupRow) -> Result<GroupDetail, ApiError> {
    let members = ctx
        .storage
        .list_members(group.group_id)
        .await
        .map_err(internal)?;
    let members: Vec<MembershipInfo> = members
        .into_iter()
        .map(|m| MembershipInfo {
            user: m.email,
            chat_group: group.slug.clone(),
            role: m.role,
            nickname: m.nickname,
            last_read_at: m.last_read_at,
        })
        .collect();
    Ok(GroupDetail {
        member_count: members.len(),
        group_name: group.slug,
        groupchat_name: group.display_name,
        is_private: group.is_private,
        created_at: group.created_at,
        members,
    })
}

pub async fn join_group(
    ctx: &ApiContext,
    user_id: UserId,
    slug: &str,
    role: Role,
) -> Result<MembershipInfo, ApiError> {
    let group = resolve_group(ctx, slug).await?;
    let membership = ctx
        .storage
        .insert_membership(group.group_id, user_id, role)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::conflict("user is already a member of this group"))?;
    membership_info(ctx, &group, membership).await
}

pub async fn update_own_nickname(
    ctx: &ApiContext,
    user_id: UserId,
    slug: &str,
    nickname: Option<&str>,
) -> Result<MembershipInfo, ApiError> {
    let group = resolve_group(ctx, slug).await?;
    let membership = ctx
        .storage
        .update_nickname(group.group_id, user_id, nickname)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("membership does not exist"))?;
    membership_info(ctx, &group, membership).await
}

pub async fn mark_read(ctx: &ApiContext, user_id: UserId, slug: &str) -> Result<(), ApiError> {
    let group = resolve_group(ctx, slug).await?;
    let updated = ctx
        .storage
        .mark_read(group.group_id, user_id)
        .await
        .map_err(internal)?;
    if updated {
        Ok(())
    } else {
        Err(ApiError::not_found("membership does not exist"))
    }
}

async fn membership_info(
    ctx: &ApiContext,
    group: &GroupRow,
    membership: MembershipRow,
) -> Result<MembershipInfo, ApiError> {
    let email = ctx
        .storage
        .user_by_id(membership.user_id)
        .await
        .map_err(internal)?
        .map(|u| u.email)
        .unwrap_or_default();
    Ok(MembershipInfo {
        user: email,
        chat_group: group.slug.clone(),
        role: membership.role,
        nickname: membership.nickname,
        last_read_at: membership.last_read_at,
    })
}

/// The single write path for both the live gateway and the relay endpoint.
/// Validates membership and body-or-attachment presence; the returned message
/// carries the server-assigned creation timestamp.
pub async fn append_message(
    ctx: &ApiContext,
    group: &GroupRow,
    author_id: UserId,
    body: Option<&str>,
    attachment: Option<NewAttachment>,
) -> Result<StoredMessage, ApiError> {
    ensure_member(ctx, group, author_id).await?;

    let body = body.map(str::trim).filter(|b| !b.is_empty());
    if body.is_none() && attachment.is_none() {
        return Err(ApiError::validation(
            "either body text or file must be provided",
        ));
    }

    let stored_attachment = attachment.map(NewAttachment::into_stored);
    ctx.storage
        .insert_message(group.group_id, author_id, body, stored_attachment.as_ref())
        .await
        .map_err(internal)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    slug: &str,
    limit: u32,
    before: Option<MessageId>,
    body_filter: Option<&str>,
) -> Result<MessagePage, ApiError> {
    let group = resolve_group(ctx, slug).await?;
    ensure_member(ctx, &group, user_id).await?;

    let messages = ctx
        .storage
        .list_messages(group.group_id, limit, before, body_filter)
        .await
        .map_err(internal)?;

    let next_before = if messages.len() as u32 == limit {
        messages.last().map(|m| m.message_id)
    } else {
        None
    };

    let mut results = Vec::with_capacity(messages.len());
    for message in messages {
        let author = ctx
            .storage
            .user_by_id(message.author_id)
            .await
            .map_err(internal)?
            .map(|u| u.email)
            .unwrap_or_default();
        results.push(MessageRecord {
            id: message.message_id,
            group: message.group_id,
            author,
            body: message.body,
            file: message.attachment.map(file_info),
            created: message.created_at,
        });
    }

    Ok(MessagePage {
        results,
        next_before,
    })
}

/// Builds the fan-out payload for a freshly stored message, enriching it with
/// the sender's per-group membership data (looked up or lazily created).
pub async fn chat_frame(
    ctx: &ApiContext,
    group: &GroupRow,
    message: &StoredMessage,
) -> Result<ChatFrame, ApiError> {
    let membership = ctx
        .storage
        .membership_or_insert(group.group_id, message.author_id)
        .await
        .map_err(internal)?;
    let email = ctx
        .storage
        .user_by_id(message.author_id)
        .await
        .map_err(internal)?
        .map(|u| u.email)
        .unwrap_or_default();

    Ok(ChatFrame {
        message: MessageBody {
            id: message.message_id,
            body: message.body.clone(),
            file: message.attachment.clone().map(file_info),
            created: message.created_at,
        },
        user: SenderInfo {
            email,
            nickname: membership.nickname,
            last_read_at: membership.last_read_at,
        },
    })
}

fn file_info(attachment: StoredAttachment) -> FileInfo {
    FileInfo {
        url: attachment.url,
        filename: attachment.filename,
        is_image: attachment.is_image,
    }
}

/// Processes one relay webhook batch. Individual events that fail to resolve
/// or parse are logged and skipped; the batch itself always succeeds.
pub async fn ingest_relay_batch(ctx: &ApiContext, batch: &RelayBatch) -> Result<RelayAck, ApiError> {
    let mut processed = 0usize;
    let mut skipped = 0usize;

    for event in &batch.messages {
        match ingest_relay_event(ctx, &batch.channel, event).await {
            Ok(()) => processed += 1,
            Err(err) => {
                warn!(
                    channel = %batch.channel,
                    event = %event.name,
                    client_id = %event.client_id,
                    %err,
                    "skipping relay event"
                );
                skipped += 1;
            }
        }
    }

    info!(channel = %batch.channel, processed, skipped, "relay batch processed");
    Ok(RelayAck {
        status: "success".to_string(),
        processed,
        skipped,
    })
}

async fn ingest_relay_event(
    ctx: &ApiContext,
    channel: &str,
    event: &RelayEvent,
) -> Result<(), ApiError> {
    let group = resolve_group(ctx, channel).await?;
    let author = ctx
        .storage
        .user_by_email(&event.client_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("user '{}' does not exist", event.client_id)))?;

    match event.name.as_str() {
        "new-message" => {
            let body = event
                .data
                .as_ref()
                .and_then(|v| v.as_str())
                .ok_or_else(|| ApiError::validation("new-message event has no text payload"))?;
            append_message(ctx, &group, author.user_id, Some(body), None).await?;
        }
        "new-file" => {
            let attachment = relay_attachment(event)?;
            append_message(ctx, &group, author.user_id, None, Some(attachment)).await?;
        }
        other => {
            return Err(ApiError::validation(format!(
                "unknown relay event kind '{other}'"
            )));
        }
    }
    Ok(())
}

/// Relay file payloads arrive as a JSON string encoding
/// `[file_name, file_type, file_url]`.
fn relay_attachment(event: &RelayEvent) -> Result<NewAttachment, ApiError> {
    let raw = event
        .data
        .as_ref()
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::validation("new-file event has no payload"))?;
    let parts: Vec<String> = serde_json::from_str(raw)
        .map_err(|_| ApiError::validation("new-file payload is not a JSON string array"))?;
    let [file_name, file_type, file_url] = <[String; 3]>::try_from(parts)
        .map_err(|_| ApiError::validation("new-file payload must have exactly three fields"))?;

    Ok(NewAttachment {
        url: file_url,
        filename: file_name,
        mime_type: Some(file_type),
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
