//! Mapping from the child's loosely-typed JSON payloads to table
//! columns.
//!
//! The browser child returns whatever the platform's web API handed
//! it. Coercion to column types happens here, at the persistence
//! boundary: unknown keys are ignored, missing or mistyped keys yield
//! [`SqlValue::Null`]. Statistics arrive as JSON strings in some
//! payload revisions, so the integer coercion also parses numeric
//! strings.

use serde_json::Value;

/// A typed column value ready for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Column set shared by the account and user-details rows, plus the
/// platform id that keys the details row.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub tiktok_id: String,
    pub columns: Vec<(&'static str, SqlValue)>,
}

/// Column set for one video row.
#[derive(Debug, Clone)]
pub struct VideoRecord {
    pub video_id: String,
    pub columns: Vec<(&'static str, SqlValue)>,
}

/// Walk a nested key path; JSON null counts as absent.
fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_null() { None } else { Some(current) }
}

fn text(value: Option<&Value>) -> SqlValue {
    match value {
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(Value::Number(n)) => SqlValue::Text(n.to_string()),
        _ => SqlValue::Null,
    }
}

fn integer(value: Option<&Value>) -> SqlValue {
    match value {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Int(i),
            None => n
                .as_f64()
                .map(|f| SqlValue::Int(f as i64))
                .unwrap_or(SqlValue::Null),
        },
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(SqlValue::Int)
            .unwrap_or(SqlValue::Null),
        Some(Value::Bool(b)) => SqlValue::Int(i64::from(*b)),
        _ => SqlValue::Null,
    }
}

fn boolean(value: Option<&Value>) -> SqlValue {
    match value {
        Some(Value::Bool(b)) => SqlValue::Bool(*b),
        Some(Value::Number(n)) => SqlValue::Bool(n.as_i64().is_some_and(|i| i != 0)),
        _ => SqlValue::Null,
    }
}

/// Flatten a `get_user_info` payload into account/user-details columns.
///
/// Returns `None` when the payload carries no platform user id; both
/// rows are keyed on it, so there is nothing to write.
pub fn account_record(payload: &Value) -> Option<AccountRecord> {
    let user = lookup(payload, &["userInfo", "user"])?;
    let tiktok_id = match text(user.get("id")) {
        SqlValue::Text(id) if !id.is_empty() => id,
        _ => return None,
    };

    let stat = |key: &str| integer(lookup(payload, &["userInfo", "stats", key]));

    let columns = vec![
        ("tiktok_id", SqlValue::Text(tiktok_id.clone())),
        ("unique_id", text(user.get("uniqueId"))),
        ("nickname", text(user.get("nickname"))),
        ("avatar_larger", text(user.get("avatarLarger"))),
        ("avatar_medium", text(user.get("avatarMedium"))),
        ("avatar_thumb", text(user.get("avatarThumb"))),
        ("signature", text(user.get("signature"))),
        ("verified", boolean(user.get("verified"))),
        ("sec_uid", text(user.get("secUid"))),
        ("private_account", boolean(user.get("privateAccount"))),
        ("following_visibility", integer(user.get("followingVisibility"))),
        ("comment_setting", integer(user.get("commentSetting"))),
        ("duet_setting", integer(user.get("duetSetting"))),
        ("stitch_setting", integer(user.get("stitchSetting"))),
        ("download_setting", integer(user.get("downloadSetting"))),
        ("profile_embed_permission", integer(user.get("profileEmbedPermission"))),
        (
            "profile_tab_show_playlist_tab",
            boolean(lookup(user, &["profileTab", "showPlaylistTab"])),
        ),
        (
            "commerce_user",
            boolean(lookup(user, &["commerceUserInfo", "commerceUser"])),
        ),
        (
            "tt_seller",
            boolean(lookup(user, &["commerceUserInfo", "ttSeller"])),
        ),
        ("relation", integer(user.get("relation"))),
        ("is_ad_virtual", boolean(user.get("isAdVirtual"))),
        ("is_embed_banned", boolean(user.get("isEmbedBanned"))),
        ("open_favorite", boolean(user.get("openFavorite"))),
        ("nick_name_modify_time", integer(user.get("nicknameModifyTime"))),
        ("can_exp_playlist", boolean(user.get("canExpPlaylist"))),
        ("secret", boolean(user.get("secret"))),
        ("ftc", boolean(user.get("ftc"))),
        ("link", text(lookup(user, &["bioLink", "link"]))),
        ("risk", integer(lookup(user, &["bioLink", "risk"]))),
        ("digg_count", stat("diggCount")),
        ("follower_count", stat("followerCount")),
        ("following_count", stat("followingCount")),
        ("friend_count", stat("friendCount")),
        ("heart_count", stat("heartCount")),
        ("video_count", stat("videoCount")),
    ];

    Some(AccountRecord { tiktok_id, columns })
}

/// Flatten one `get_user_videos` entry into video columns.
///
/// Returns `None` when the entry has no video id to key on.
pub fn video_record(video: &Value) -> Option<VideoRecord> {
    let video_id = match text(video.get("id")) {
        SqlValue::Text(id) if !id.is_empty() => id,
        _ => return None,
    };

    // statsV2 reports counters as strings; integer() parses them.
    let stat = |key: &str| integer(lookup(video, &["statsV2", key]));

    let columns = vec![
        ("author_id", text(lookup(video, &["author", "id"]))),
        ("AIGCDescription", text(video.get("AIGCDescription"))),
        ("CategoryType", integer(video.get("CategoryType"))),
        (
            "backendSourceEventTracking",
            text(video.get("backendSourceEventTracking")),
        ),
        ("collected", boolean(video.get("collected"))),
        ("createTime", integer(video.get("createTime"))),
        ("video_desc", text(video.get("desc"))),
        ("digged", boolean(video.get("digged"))),
        ("diversificationId", integer(video.get("diversificationId"))),
        ("duetDisplay", integer(video.get("duetDisplay"))),
        ("duetEnabled", boolean(video.get("duetEnabled"))),
        ("forFriend", boolean(video.get("forFriend"))),
        ("itemCommentStatus", integer(video.get("itemCommentStatus"))),
        ("officalItem", boolean(video.get("officalItem"))),
        ("originalItem", boolean(video.get("originalItem"))),
        ("privateItem", boolean(video.get("privateItem"))),
        ("secret", boolean(video.get("secret"))),
        ("shareEnabled", boolean(video.get("shareEnabled"))),
        ("stitchDisplay", integer(video.get("stitchDisplay"))),
        ("stitchEnabled", boolean(video.get("stitchEnabled"))),
        (
            "can_repost",
            boolean(lookup(video, &["itemControl", "can_repost"])),
        ),
        ("collectCount", stat("collectCount")),
        ("commentCount", stat("commentCount")),
        ("diggCount", stat("diggCount")),
        ("playCount", stat("playCount")),
        ("repostCount", stat("repostCount")),
        ("shareCount", stat("shareCount")),
    ];

    Some(VideoRecord { video_id, columns })
}
