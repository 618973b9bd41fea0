//! Typed registries of broadcast message types and RPC action names.
//!
//! The wire keeps the established string names; everything inside the
//! process works with the enums so handler tables are keyed exhaustively.

use std::fmt;
use std::str::FromStr;

/// A name that is not in the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown name '{0}'")]
pub struct UnknownName(pub String);

/// Broadcast message types (envelope `path`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Someone liked a recipe post.
    NotifyFoodLiked,
    /// Someone commented on a recipe post.
    NotifyFoodCommented,
    /// Someone saved a recipe post to a collection.
    NotifyFoodSaved,
    /// Someone followed a user.
    NotifyUserFollowed,
    /// An order for a recipe kit was paid.
    NotifyOrderPaid,
    /// A user's public profile changed.
    UserUpdated,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::NotifyFoodLiked,
        MessageType::NotifyFoodCommented,
        MessageType::NotifyFoodSaved,
        MessageType::NotifyUserFollowed,
        MessageType::NotifyOrderPaid,
        MessageType::UserUpdated,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::NotifyFoodLiked => "NOTIFY_FOOD_LIKED",
            MessageType::NotifyFoodCommented => "NOTIFY_FOOD_COMMENTED",
            MessageType::NotifyFoodSaved => "NOTIFY_FOOD_SAVED",
            MessageType::NotifyUserFollowed => "NOTIFY_USER_FOLLOWED",
            MessageType::NotifyOrderPaid => "NOTIFY_ORDER_PAID",
            MessageType::UserUpdated => "USER_UPDATED",
        }
    }
}

impl FromStr for MessageType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC actions (request `action`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    GetUserById,
    GetUsersByIds,
    GetFollowerIds,
    GetPostById,
    GetPostsByAuthor,
    CountUnreadNotifications,
}

impl ActionName {
    pub const ALL: [ActionName; 6] = [
        ActionName::GetUserById,
        ActionName::GetUsersByIds,
        ActionName::GetFollowerIds,
        ActionName::GetPostById,
        ActionName::GetPostsByAuthor,
        ActionName::CountUnreadNotifications,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::GetUserById => "rpcGetUserById",
            ActionName::GetUsersByIds => "rpcGetUsersByIds",
            ActionName::GetFollowerIds => "rpcGetFollowerIds",
            ActionName::GetPostById => "rpcGetPostById",
            ActionName::GetPostsByAuthor => "rpcGetPostsByAuthor",
            ActionName::CountUnreadNotifications => "rpcCountUnreadNotifications",
        }
    }
}

impl FromStr for ActionName {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_names_parse_back() {
        for message_type in MessageType::ALL {
            assert_eq!(message_type.as_str().parse::<MessageType>(), Ok(message_type));
        }
    }

    #[test]
    fn test_action_names_parse_back() {
        for action in ActionName::ALL {
            assert_eq!(action.as_str().parse::<ActionName>(), Ok(action));
        }
    }

    #[test]
    fn test_unknown_names() {
        assert_eq!(
            "rpcUnknownAction".parse::<ActionName>(),
            Err(UnknownName("rpcUnknownAction".to_string()))
        );
        assert!("notify_food_liked".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_display_uses_wire_name() {
        assert_eq!(MessageType::NotifyFoodLiked.to_string(), "NOTIFY_FOOD_LIKED");
        assert_eq!(ActionName::GetUserById.to_string(), "rpcGetUserById");
    }
}
