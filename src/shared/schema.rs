diesel::table! {
    users (user_id) {
        user_id -> Int8,
        username -> Nullable<Text>,
        role -> Text,
        client_type -> Text,
        is_blocked -> Bool,
        is_paid -> Bool,
        reminder_step -> Int2,
        created_at -> Timestamptz,
        last_seen -> Timestamptz,
    }
}

diesel::table! {
    tickets (ticket_id) {
        ticket_id -> Int4,
        client_user_id -> Int8,
        status -> Text,
        assigned_to_support_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        taken_at -> Nullable<Timestamptz>,
        first_reply_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        sla_stage -> Int2,
        support_thread_id -> Nullable<Int8>,
        card_message_id -> Nullable<Int8>,
        topic_card_message_id -> Nullable<Int8>,
    }
}

diesel::table! {
    ticket_messages (message_id) {
        message_id -> Int4,
        ticket_id -> Int4,
        direction -> Text,
        author_user_id -> Nullable<Int8>,
        text -> Nullable<Text>,
        media_type -> Nullable<Text>,
        media_file_id -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(tickets -> users (client_user_id));
diesel::joinable!(ticket_messages -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(users, tickets, ticket_messages);
