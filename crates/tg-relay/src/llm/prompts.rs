/// Sampling parameters of a single chat completion call
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sampling {
    pub(crate) temperature: f32,
    pub(crate) top_p: f32,
    pub(crate) max_tokens: u32,
}

/// Yes/no classification needs short and predictable answers
pub(crate) const STRICT: Sampling = Sampling {
    temperature: 0.1,
    top_p: 0.1,
    max_tokens: 16,
};

pub(crate) const REWRITE: Sampling = Sampling {
    temperature: 0.2,
    top_p: 0.1,
    max_tokens: 1024,
};

pub(crate) const AD_CHECK_SYSTEM: &str = "Определение рекламы в тексте сообщения";

/// The model answers with this word if it considers the text an advertisement
pub(crate) const AD_CHECK_POSITIVE_ANSWER: &str = "Да";

pub(crate) fn ad_check(text: &str) -> String {
    format!(
        "Пожалуйста, проанализируй следующее сообщение и определи, содержит ли оно \
        прямую или косвенную рекламу. Под рекламой понимается любое сообщение, которое:\n\
        - Призывает к покупке, заказу или подписке.\n\
        - Включает в себя ссылки или контактные данные для связи.\n\
        - Содержит прямые призывы к действию (например, \"сделайте заказ\", \"подпишитесь\").\n\
        - Продвигает коммерческие организации и их деятельность.\n\n\
        Сообщение для анализа:\n\"{text}\"\n\n\
        Если сообщение содержит рекламу, ответь \"Да\". Если рекламы нет, ответь \"Нет\"."
    )
}

pub(crate) fn rewrite(text: &str) -> String {
    format!(
        "Перепиши текст ниже, изменив каждое предложение. Сохрани основной смысл, но \
        переформулируй так, чтобы текст выглядел полностью уникальным. Используй синонимы \
        для большинства слов и изменяй структуру предложений.\n\n\
        Удали все упоминания источников, корреспондентов, веб-сайтов и социальных сетей. \
        Убери любые ссылки на каналы или другие медиа.\n\n\
        Исходный текст: \"{text}\""
    )
}
