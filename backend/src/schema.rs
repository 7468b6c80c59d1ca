// Mirrors schema.sql.

diesel::table! {
    devices (device_id) {
        device_id -> Text,
        api_token -> Text,
    }
}

diesel::table! {
    sessions (session_id) {
        session_id -> BigInt,
        device_id -> Text,
        started_at -> BigInt,
        active_until -> BigInt,
    }
}

diesel::table! {
    measurements (session_id, seq) {
        session_id -> BigInt,
        seq -> Integer,
        recorded_at -> BigInt,
        ntu -> Double,
        raw_mv -> BigInt,
    }
}

diesel::joinable!(measurements -> sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(devices, sessions, measurements,);
