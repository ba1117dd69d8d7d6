use crate::services::notification_service::Button;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub fn inline_keyboard(rows: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
            .collect::<Vec<_>>()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_keep_their_shape() {
        let rows = vec![
            vec![Button::new("✅ Confirm Purchase", "confirm")],
            vec![Button::new("A", "a"), Button::new("B", "b")],
        ];
        let markup = inline_keyboard(&rows);
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(markup.inline_keyboard[1].len(), 2);
        assert_eq!(markup.inline_keyboard[0][0].text, "✅ Confirm Purchase");
    }
}
