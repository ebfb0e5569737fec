//! 协议常量：事件类型、账户数据类型、SSSS 算法标识

// 房间状态 / 消息事件
pub const M_ROOM_CANONICAL_ALIAS: &str = "m.room.canonical_alias";
pub const M_ROOM_CREATE: &str = "m.room.create";
pub const M_ROOM_JOIN_RULES: &str = "m.room.join_rules";
pub const M_ROOM_MEMBER: &str = "m.room.member";
pub const M_ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const M_ROOM_MESSAGE: &str = "m.room.message";
pub const M_ROOM_ENCRYPTION: &str = "m.room.encryption";
pub const M_ROOM_ENCRYPTED: &str = "m.room.encrypted";
pub const M_ROOM_TOMBSTONE: &str = "m.room.tombstone";
pub const M_ROOM_NAME: &str = "m.room.name";
pub const M_ROOM_AVATAR: &str = "m.room.avatar";
pub const M_ROOM_TOPIC: &str = "m.room.topic";
pub const M_SPACE_CHILD: &str = "m.space.child";
pub const M_SPACE_PARENT: &str = "m.space.parent";

/// 打开一个房间所需的最小状态集合（本地缓存优先加载）
pub const ESSENTIAL_STATE_TYPES: &[&str] = &[
    M_ROOM_CREATE,
    M_ROOM_TOMBSTONE,
    M_ROOM_ENCRYPTION,
    M_ROOM_POWER_LEVELS,
    M_ROOM_NAME,
    M_ROOM_AVATAR,
    M_ROOM_TOPIC,
    M_SPACE_CHILD,
    M_SPACE_PARENT,
];

// 账户数据
pub const M_DIRECT: &str = "m.direct";
pub const M_IGNORED_USER_LIST: &str = "m.ignored_user_list";
pub const M_SECRET_STORAGE_DEFAULT_KEY: &str = "m.secret_storage.default_key";
/// 实际类型名为 `m.secret_storage.key.<keyId>`
pub const M_SECRET_STORAGE_KEY_PREFIX: &str = "m.secret_storage.key";

// Secret storage
pub const M_SECRET_STORAGE_V1_AES_HMAC_SHA2: &str = "m.secret_storage.v1.aes-hmac-sha2";
pub const M_CROSS_SIGNING_MASTER: &str = "m.cross_signing.master";
pub const M_CROSS_SIGNING_USER_SIGNING: &str = "m.cross_signing.user_signing";
pub const M_CROSS_SIGNING_SELF_SIGNING: &str = "m.cross_signing.self_signing";

// Client-Server API 路径
pub const SYNC_PATH: &str = "/_matrix/client/v3/sync";

/// 某个 key id 对应的 key description 账户数据类型名
pub fn secret_storage_key_type(key_id: &str) -> String {
    format!("{}.{}", M_SECRET_STORAGE_KEY_PREFIX, key_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_description_type_is_scoped_by_key_id() {
        assert_eq!(secret_storage_key_type("abc"), "m.secret_storage.key.abc");
    }
}
