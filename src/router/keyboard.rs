use std::collections::HashMap;

use tracing::debug;

use super::callback::wrap_callback_data;
use super::pagination::{PAGE_BACK, PAGE_NEXT};
use crate::storage::KeyboardInfo;
use crate::transport::{InlineButton, InlineKeyboard};

pub const BACK_LABEL: &str = "« Back";
pub const NEXT_LABEL: &str = "Next »";

/// Paged keyboard of callback buttons, one button per row. Each key is
/// the button text and `data[key]` its callback data.
pub fn build_inline_data_keyboard(
    sorted_keys: &[String],
    data: &HashMap<String, String>,
    page_size: usize,
) -> Option<KeyboardInfo> {
    build_inline_keyboard(sorted_keys, data, page_size, |text, data| {
        InlineButton::callback(text, data)
    })
}

/// Paged keyboard of URL buttons; `data[key]` is the link.
pub fn build_inline_url_keyboard(
    sorted_keys: &[String],
    data: &HashMap<String, String>,
    page_size: usize,
) -> Option<KeyboardInfo> {
    build_inline_keyboard(sorted_keys, data, page_size, |text, url| {
        InlineButton::url(text, url)
    })
}

fn build_inline_keyboard<F>(
    sorted_keys: &[String],
    data: &HashMap<String, String>,
    page_size: usize,
    button: F,
) -> Option<KeyboardInfo>
where
    F: Fn(String, String) -> InlineButton,
{
    if sorted_keys.is_empty() {
        debug!("empty data for inline keyboard");
        return None;
    }

    let page_size = page_size.max(1);
    let pages = sorted_keys.chunks(page_size).count();

    let keyboards = sorted_keys
        .chunks(page_size)
        .enumerate()
        .map(|(page, keys)| {
            let mut rows: Vec<Vec<InlineButton>> = keys
                .iter()
                .map(|key| {
                    let value = data.get(key).cloned().unwrap_or_default();
                    vec![button(key.clone(), value)]
                })
                .collect();

            let mut nav = Vec::new();
            if page > 0 {
                nav.push(InlineButton::callback(
                    BACK_LABEL,
                    wrap_callback_data(PAGE_BACK, "1"),
                ));
            }
            if page + 1 < pages {
                nav.push(InlineButton::callback(
                    NEXT_LABEL,
                    wrap_callback_data(PAGE_NEXT, "1"),
                ));
            }
            if !nav.is_empty() {
                rows.push(nav);
            }
            InlineKeyboard::new(rows)
        })
        .collect();

    Some(KeyboardInfo {
        keyboards,
        current_position: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ButtonAction;

    fn fixture(n: usize) -> (Vec<String>, HashMap<String, String>) {
        let keys: Vec<String> = (1..=n).map(|i| format!("item {i}")).collect();
        let data = keys
            .iter()
            .map(|k| (k.clone(), format!("pick_{k}")))
            .collect();
        (keys, data)
    }

    fn nav_labels(keyboard: &InlineKeyboard) -> Vec<&str> {
        keyboard
            .rows
            .last()
            .map(|row| {
                row.iter()
                    .filter(|b| b.text == BACK_LABEL || b.text == NEXT_LABEL)
                    .map(|b| b.text.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_empty_keys() {
        assert!(build_inline_data_keyboard(&[], &HashMap::new(), 3).is_none());
    }

    #[test]
    fn test_single_page_has_no_navigation() {
        let (keys, data) = fixture(2);
        let info = build_inline_data_keyboard(&keys, &data, 5).unwrap();
        assert_eq!(info.keyboards.len(), 1);
        assert_eq!(info.keyboards[0].rows.len(), 2);
        assert!(nav_labels(&info.keyboards[0]).is_empty());
    }

    #[test]
    fn test_navigation_rows() {
        let (keys, data) = fixture(7);
        let info = build_inline_data_keyboard(&keys, &data, 3).unwrap();
        assert_eq!(info.keyboards.len(), 3);
        assert_eq!(info.current_position, 0);

        assert_eq!(nav_labels(&info.keyboards[0]), vec![NEXT_LABEL]);
        assert_eq!(nav_labels(&info.keyboards[1]), vec![BACK_LABEL, NEXT_LABEL]);
        // short last page still gets its back button
        assert_eq!(info.keyboards[2].rows.len(), 2);
        assert_eq!(nav_labels(&info.keyboards[2]), vec![BACK_LABEL]);

        let next = &info.keyboards[0].rows[3][0];
        assert_eq!(next.action, ButtonAction::Callback("page-next_1".into()));
    }

    #[test]
    fn test_url_buttons() {
        let keys = vec!["docs".to_string()];
        let data = HashMap::from([("docs".to_string(), "https://example.org".to_string())]);
        let info = build_inline_url_keyboard(&keys, &data, 10).unwrap();
        assert_eq!(
            info.keyboards[0].rows[0][0].action,
            ButtonAction::Url("https://example.org".into())
        );
    }
}
