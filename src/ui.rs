// Terminal output helpers shared by the deploy and inspect commands.

use colored::Colorize;

use crate::domain::bundle::Component;

const RULE_WIDTH: usize = 62;

/// Section banner: the title inset into a horizontal rule.
pub fn print_header(title: &str) {
    let tail = RULE_WIDTH.saturating_sub(title.len() + 4);
    println!();
    println!(
        "{}",
        format!("── {title} {}", "─".repeat(tail)).bright_blue().bold()
    );
    println!();
}

pub fn print_success(message: &str) {
    println!("{}", format!("✔ {message}").bright_green().bold());
}

pub fn print_error(message: &str) {
    eprintln!("{}", format!("✖ {message}").bright_red().bold());
}

pub fn print_warning(message: &str) {
    println!("{}", format!("! {message}").bright_yellow());
}

/// Table of the components about to deploy, shown before confirmation.
pub fn print_component_table(components: &[Component]) {
    println!(
        "{}",
        format!(
            "{:<24} {:>7} {:>7} {:>7}",
            "COMPONENT", "IMAGES", "REPOS", "CHARTS"
        )
        .bold()
    );
    for component in components {
        println!(
            "{:<24} {:>7} {:>7} {:>7}",
            component.name,
            component.images.len(),
            component.repos.len(),
            component.charts.len() + component.manifests.len(),
        );
    }
    println!();
}

/// service → URL rows printed after a successful deploy.
pub fn print_connection_table(rows: &[(String, String)]) {
    if rows.is_empty() {
        return;
    }
    println!("{}", format!("{:<40} {}", "SERVICE", "URL").bold());
    for (service, url) in rows {
        println!("{:<40} {}", service, url.bright_cyan());
    }
    println!();
}
