//! Row-mapping glue shared by the store modules.

/// Parse a TEXT discriminator column into its enum, mapping bad stored
/// values onto rusqlite's column error so row mappers stay uniform.
pub(crate) fn parse_col<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: ParseableEnum,
{
    let raw: String = row.get(idx)?;
    T::parse_str(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown enum value: {raw}").into(),
        )
    })
}

/// Internal glue so `parse_col` works over every str-backed enum.
pub(crate) trait ParseableEnum: Sized {
    fn parse_str(s: &str) -> Option<Self>;
}

macro_rules! parseable {
    ($($ty:ty),+ $(,)?) => {
        $(impl ParseableEnum for $ty {
            fn parse_str(s: &str) -> Option<Self> {
                <$ty>::parse(s).ok()
            }
        })+
    };
}

parseable!(
    crate::types::ReplyOrder,
    crate::types::InputPolicy,
    crate::types::MembershipKind,
    crate::types::Participation,
    crate::types::MemberStatus,
    crate::types::CopilotMode,
    crate::types::ConversationKind,
    crate::types::SchedulingState,
    crate::types::Role,
    crate::types::Visibility,
);
