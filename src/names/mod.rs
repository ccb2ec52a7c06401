use std::any::type_name;

use serde::Serialize;

pub const QUEUE_PREFIX: &str = "mq:";
pub const TOPIC_IN: &str = "mq:topic:in";
pub const STOP_COMMAND: &str = "STOP";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Normal,
    Priority,
}

/// All list names derived from one message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueNames {
    pub message_type: String,
    pub in_q: String,
    pub priority_q: String,
    pub out_q: String,
    pub dlq: String,
}

impl QueueNames {
    pub fn for_type(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_owned(),
            in_q: format!("{QUEUE_PREFIX}{message_type}.inq"),
            priority_q: format!("{QUEUE_PREFIX}{message_type}.priorityq"),
            out_q: format!("{QUEUE_PREFIX}{message_type}.outq"),
            dlq: format!("{QUEUE_PREFIX}{message_type}.dlq"),
        }
    }

    pub fn of<T: ?Sized>() -> Self {
        Self::for_type(&message_type_name::<T>())
    }

    pub fn inbox(&self, kind: QueueKind) -> &str {
        match kind {
            QueueKind::Normal => &self.in_q,
            QueueKind::Priority => &self.priority_q,
        }
    }

    pub fn kind_of(&self, queue_name: &str) -> Option<QueueKind> {
        if queue_name == self.in_q {
            Some(QueueKind::Normal)
        } else if queue_name == self.priority_q {
            Some(QueueKind::Priority)
        } else {
            None
        }
    }
}

/// Type name with module paths stripped, generics kept: `app::Wrap<app::Incr>` -> `Wrap<Incr>`.
pub fn message_type_name<T: ?Sized>() -> String {
    let full = type_name::<T>();
    let mut rendered = String::with_capacity(full.len());
    let mut segment = String::new();

    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            segment.push(ch);
            continue;
        }
        rendered.push_str(last_path_segment(&segment));
        segment.clear();
        if ch != ' ' {
            rendered.push(ch);
        }
    }
    rendered.push_str(last_path_segment(&segment));
    rendered
}

fn last_path_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::{message_type_name, QueueKind, QueueNames, TOPIC_IN};

    struct Incr;
    #[allow(dead_code)]
    struct Wrap<T>(T);

    #[test]
    fn derives_queue_names_from_type() {
        let names = QueueNames::of::<Incr>();

        assert_eq!(names.message_type, "Incr");
        assert_eq!(names.in_q, "mq:Incr.inq");
        assert_eq!(names.priority_q, "mq:Incr.priorityq");
        assert_eq!(names.out_q, "mq:Incr.outq");
        assert_eq!(names.dlq, "mq:Incr.dlq");
        assert_ne!(names.in_q, TOPIC_IN);
    }

    #[test]
    fn strips_paths_inside_generic_arguments() {
        assert_eq!(message_type_name::<Wrap<Incr>>(), "Wrap<Incr>");
        assert_eq!(message_type_name::<Vec<(u8, String)>>(), "Vec<(u8,String)>");
    }

    #[test]
    fn resolves_inbox_by_kind_and_back() {
        let names = QueueNames::for_type("Ping");

        assert_eq!(names.inbox(QueueKind::Priority), "mq:Ping.priorityq");
        assert_eq!(names.kind_of("mq:Ping.inq"), Some(QueueKind::Normal));
        assert_eq!(names.kind_of("mq:Ping.priorityq"), Some(QueueKind::Priority));
        assert_eq!(names.kind_of("mq:Ping.dlq"), None);
    }
}
