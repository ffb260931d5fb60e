// Registry schema - change tracking tables for Diesel ORM
//
// The registry lives in its own SQLite file attached to the target
// connection as `sqitch`, hence the schema-qualified table names.

diesel::table! {
    sqitch.releases (version) {
        version -> Text,
        installed_at -> Text,
        installer_name -> Text,
        installer_email -> Text,
    }
}

diesel::table! {
    sqitch.projects (project) {
        project -> Text,
        uri -> Nullable<Text>,
        created_at -> Text,
        creator_name -> Text,
        creator_email -> Text,
    }
}

diesel::table! {
    sqitch.changes (change_id) {
        change_id -> Text,
        script_hash -> Nullable<Text>,
        change -> Text,
        project -> Text,
        note -> Text,
        committed_at -> Text,
        committer_name -> Text,
        committer_email -> Text,
        planned_at -> Text,
        planner_name -> Text,
        planner_email -> Text,
    }
}

diesel::table! {
    sqitch.dependencies (change_id, dependency) {
        change_id -> Text,
        #[sql_name = "type"]
        dependency_type -> Text,
        dependency -> Text,
        dependency_id -> Nullable<Text>,
    }
}

diesel::table! {
    sqitch.events (change_id, committed_at) {
        event -> Text,
        change_id -> Text,
        change -> Text,
        project -> Text,
        note -> Text,
        requires -> Text,
        conflicts -> Text,
        tags -> Text,
        committed_at -> Text,
        committer_name -> Text,
        committer_email -> Text,
        planned_at -> Text,
        planner_name -> Text,
        planner_email -> Text,
    }
}

diesel::table! {
    sqitch.tags (tag_id) {
        tag_id -> Text,
        tag -> Text,
        project -> Text,
        change_id -> Text,
        note -> Text,
        committed_at -> Text,
        committer_name -> Text,
        committer_email -> Text,
        planned_at -> Text,
        planner_name -> Text,
        planner_email -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    releases,
    projects,
    changes,
    dependencies,
    events,
    tags,
);
