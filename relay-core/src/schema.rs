use diesel::table;

table! {
    push_subscriptions (id) {
        id -> Uuid,
        user_id -> Text,
        endpoint -> Text,
        p256dh -> Text,
        auth -> Text,
        user_agent -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}
